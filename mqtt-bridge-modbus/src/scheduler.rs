//! One polling task per serial line.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rtugate_common::StatusCode;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::alerts::Trigger;
use crate::backoff::{BackoffState, PortState};
use crate::bridge::format_value;
use crate::config::{LineSettings, NodeConfig, ParamKey};
use crate::heartbeat::{HeartbeatMonitor, HeartbeatPolicy};
use crate::outputs::{Emission, Outputs, ParamContext};
use crate::poller::{NodePoller, ReadResult};
use crate::publish::PublishState;
use crate::transport::{PortOpener, RegisterReader};

/// Runtime state of one node, owned by its line.
struct NodeRuntime {
    config: NodeConfig,
    poller: NodePoller,
    params: Vec<ParamContext>,
    publish: Vec<PublishState>,
    backoff: BackoffState,
    heartbeat: HeartbeatMonitor,
    ok_reads: u64,
    failed_reads: u64,
}

impl NodeRuntime {
    fn new(
        line: &str,
        node: &NodeConfig,
        settings: &LineSettings,
        outputs: &Outputs,
        start: Instant,
    ) -> Self {
        let poller = NodePoller::new(node, &settings.batch, settings.addressing.normalize);
        let params = node
            .params
            .iter()
            .enumerate()
            .map(|(i, p)| ParamContext {
                key: ParamKey::new(line, node.unit_id, &p.name),
                object: node.object.clone(),
                topic: outputs.bridge().resolve(&p.topic_for(&node.object)),
                register_type: p.register_type,
                address: poller.address(i).unwrap_or_default(),
            })
            .collect();

        Self {
            config: node.clone(),
            poller,
            params,
            publish: vec![PublishState::default(); node.params.len()],
            backoff: BackoffState::default(),
            heartbeat: HeartbeatMonitor::new(
                HeartbeatPolicy::from_settings(settings),
                node.params.len(),
                start,
            ),
            ok_reads: 0,
            failed_reads: 0,
        }
    }

    /// Feed one read result through the publish decision and heartbeat state.
    fn route(
        &mut self,
        i: usize,
        result: &ReadResult,
        now: Instant,
        outputs: &Outputs,
        log_reads: bool,
    ) {
        let param = &self.config.params[i];

        let value = match result.value {
            Some(value) if result.is_ok() => value,
            _ => {
                self.failed_reads += 1;
                self.heartbeat.record_failure(i, result.status, &result.message);
                debug!(
                    line = %self.params[i].key.line,
                    unit_id = self.config.unit_id,
                    param = %param.name,
                    status = %result.status,
                    error = %result.message,
                    "Read failed"
                );
                return;
            }
        };

        self.ok_reads += 1;
        if log_reads {
            debug!(
                line = %self.params[i].key.line,
                unit_id = self.config.unit_id,
                param = %param.name,
                raw = ?result.raw,
                value,
                "Read"
            );
        }

        let recovered = self.heartbeat.record_success(i, now);
        let changed = self.publish[i].last_value() != Some(value);
        let due = if recovered {
            self.publish[i].force(value, now);
            true
        } else {
            self.publish[i].evaluate(param.publish_mode, param.publish_interval(), value, now)
        };

        if due {
            outputs.emit(
                &self.params[i],
                Emission {
                    value: Some(format_value(value, param.register_type)),
                    status: StatusCode::Ok,
                    message: StatusCode::Ok.as_str().to_string(),
                    silent_for_s: 0,
                    alarm: result.raw.and_then(|raw| param.alarm_for(raw)),
                    trigger: if changed || recovered {
                        Trigger::Event
                    } else {
                        Trigger::Interval
                    },
                },
            );
        }
    }

    fn emit_heartbeats(&mut self, now: Instant, outputs: &Outputs) {
        for event in self.heartbeat.due(now) {
            let ctx = &self.params[event.param];
            debug!(
                line = %ctx.key.line,
                unit_id = ctx.key.unit_id,
                param = %ctx.key.param,
                silent_for_s = event.silent_for.as_secs(),
                "Parameter silent"
            );
            outputs.emit(
                ctx,
                Emission {
                    value: None,
                    status: StatusCode::Silent,
                    message: event.message,
                    silent_for_s: event.silent_for.as_secs(),
                    alarm: None,
                    trigger: Trigger::Event,
                },
            );
        }
    }
}

/// Polls every node of one line, strictly sequentially.
pub struct LineScheduler {
    settings: LineSettings,
    opener: Arc<dyn PortOpener>,
    outputs: Outputs,
    nodes: Vec<NodeRuntime>,
    port: PortState,
    reader: Option<Box<dyn RegisterReader>>,
    rng: SmallRng,
    last_summary: Instant,
}

impl LineScheduler {
    pub fn new(settings: LineSettings, opener: Arc<dyn PortOpener>, outputs: Outputs) -> Self {
        let start = Instant::now();
        let nodes = settings
            .line
            .nodes
            .iter()
            .map(|node| NodeRuntime::new(&settings.line.name, node, &settings, &outputs, start))
            .collect();

        Self {
            settings,
            opener,
            outputs,
            nodes,
            port: PortState::default(),
            reader: None,
            rng: SmallRng::from_os_rng(),
            last_summary: start,
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.line.name
    }

    /// Start the polling task.
    pub fn spawn(self) -> LineHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let name = self.name().to_string();
        let join = tokio::spawn(self.run(stop_rx));
        LineHandle {
            name,
            stop_tx,
            join,
        }
    }

    /// Poll until `stop` turns true or its sender is dropped.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        info!(
            line = %self.name(),
            device = %self.settings.line.device,
            nodes = self.nodes.len(),
            interval_ms = self.settings.polling.interval_ms,
            "Line started"
        );

        while !*stop.borrow() {
            let cycle_start = Instant::now();
            self.cycle(&stop).await;

            let delay = self.next_delay(cycle_start.elapsed());
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        // Dropping the reader closes the serial port.
        self.reader = None;
        info!(line = %self.name(), "Line stopped");
    }

    /// One pass over all nodes.
    pub async fn cycle(&mut self, stop: &watch::Receiver<bool>) {
        if self.reader.is_none() && self.port.can_open(Instant::now()) {
            self.open_port().await;
        }

        let log_reads = self.settings.debug.log_reads();
        for n in 0..self.nodes.len() {
            if *stop.borrow() {
                return;
            }

            let node = &mut self.nodes[n];
            if let Some(reader) = self.reader.as_mut() {
                if node.backoff.should_skip(Instant::now()) {
                    debug!(
                        line = %self.settings.line.name,
                        unit_id = node.config.unit_id,
                        "Node in backoff, skipped"
                    );
                } else {
                    let outcome = node.poller.poll(reader.as_mut()).await;
                    let now = Instant::now();

                    for (i, result) in outcome.results.iter().enumerate() {
                        node.route(i, result, now, &self.outputs, log_reads);
                    }

                    if outcome.any_success {
                        node.backoff.record_success();
                    } else if node.backoff.record_failure(
                        now,
                        self.settings.polling.max_errors_before_backoff,
                        self.settings.node_backoff(),
                    ) {
                        warn!(
                            line = %self.settings.line.name,
                            unit_id = node.config.unit_id,
                            errors = node.backoff.errors(),
                            backoff_ms = self.settings.polling.backoff_ms,
                            "Node not responding, backing off"
                        );
                    }

                    if let Some(err) = outcome.port_error {
                        let retry = self.settings.port_retry_backoff();
                        self.reader = None;
                        self.port.failed(now, retry);
                        error!(
                            line = %self.settings.line.name,
                            error = %err,
                            retry_s = retry.as_secs(),
                            "Serial port failed, closing"
                        );
                    }
                }
            }

            self.nodes[n].emit_heartbeats(Instant::now(), &self.outputs);
        }

        self.maybe_log_summary();
    }

    async fn open_port(&mut self) {
        match self.opener.open(&self.settings.line).await {
            Ok(reader) => {
                self.reader = Some(reader);
                self.port.opened();
                info!(
                    line = %self.settings.line.name,
                    device = %self.settings.line.device,
                    baudrate = self.settings.line.baudrate,
                    "Serial port opened"
                );
            }
            Err(e) => {
                let retry = self.settings.port_retry_backoff();
                self.port.failed(Instant::now(), retry);
                warn!(
                    line = %self.settings.line.name,
                    error = %e,
                    retry_s = retry.as_secs(),
                    "Serial port unavailable"
                );
            }
        }
    }

    /// `max(0, interval - elapsed) + uniform(0, jitter)`.
    fn next_delay(&mut self, elapsed: Duration) -> Duration {
        let jitter = match self.settings.polling.jitter_ms {
            0 => 0,
            max => self.rng.random_range(0..=max),
        };
        self.settings.interval().saturating_sub(elapsed) + Duration::from_millis(jitter)
    }

    fn maybe_log_summary(&mut self) {
        let Some(every) = self.settings.debug.summary_every() else {
            return;
        };
        if self.last_summary.elapsed() < every {
            return;
        }
        self.last_summary = Instant::now();

        for node in &mut self.nodes {
            info!(
                line = %self.settings.line.name,
                unit_id = node.config.unit_id,
                ok = node.ok_reads,
                failed = node.failed_reads,
                errors = node.backoff.errors(),
                port_open = self.port.is_open(),
                "Line summary"
            );
            node.ok_reads = 0;
            node.failed_reads = 0;
        }
    }
}

/// Handle to a running line task.
#[derive(Debug)]
pub struct LineHandle {
    name: String,
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl LineHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Signal the task and wait until it has exited and released its port.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.join.await {
            error!(line = %self.name, error = %e, "Line task ended abnormally");
        }
    }
}
