//! Starting, stopping and hot-swapping line schedulers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{ConfigError, GatewayConfig, LineSettings};
use crate::outputs::Outputs;
use crate::scheduler::{LineHandle, LineScheduler};
use crate::transport::PortOpener;

/// What a reload did, by line name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadReport {
    pub unchanged: Vec<String>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub restarted: Vec<String>,
}

impl ReloadReport {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.restarted.is_empty()
    }
}

struct RunningLine {
    settings: LineSettings,
    handle: LineHandle,
}

struct State {
    config: Option<GatewayConfig>,
    lines: HashMap<String, RunningLine>,
}

/// Owns the running line tasks.
pub struct HotReloadManager {
    opener: Arc<dyn PortOpener>,
    outputs: Outputs,
    state: Mutex<State>,
}

impl HotReloadManager {
    pub fn new(opener: Arc<dyn PortOpener>, outputs: Outputs) -> Self {
        Self {
            opener,
            outputs,
            state: Mutex::new(State {
                config: None,
                lines: HashMap::new(),
            }),
        }
    }

    /// Start every line of `config`.
    pub async fn start(&self, config: GatewayConfig) -> Result<ReloadReport, ConfigError> {
        self.reload(config).await
    }

    /// Move to `new`, keeping lines whose settings did not change.
    ///
    /// An invalid configuration is rejected and the running lines are left alone.
    pub async fn reload(&self, new: GatewayConfig) -> Result<ReloadReport, ConfigError> {
        new.check()?;

        let mut state = self.state.lock().await;
        let mut report = ReloadReport::default();

        if let Some(ref old) = state.config {
            if old.mqtt != new.mqtt || old.db != new.db || old.logging != new.logging {
                warn!("mqtt, db and logging changes take effect after a restart");
            }
            if old.alerts != new.alerts {
                if let Some(alerts) = self.outputs.alerts() {
                    alerts.reload(new.alerts.clone()).await;
                }
            }
        }

        let wanted = new.line_settings();
        let wanted_names: HashSet<&str> = wanted.iter().map(|s| s.line.name.as_str()).collect();

        let mut removed: Vec<String> = state
            .lines
            .keys()
            .filter(|name| !wanted_names.contains(name.as_str()))
            .cloned()
            .collect();
        removed.sort();
        for name in removed {
            if let Some(line) = state.lines.remove(&name) {
                line.handle.stop().await;
                report.removed.push(name);
            }
        }

        for settings in wanted {
            let name = settings.line.name.clone();
            match state.lines.remove(&name) {
                Some(running) if running.settings == settings && !running.handle.is_finished() => {
                    state.lines.insert(name.clone(), running);
                    report.unchanged.push(name);
                }
                Some(running) => {
                    running.handle.stop().await;
                    state.lines.insert(name.clone(), self.launch(settings));
                    report.restarted.push(name);
                }
                None => {
                    state.lines.insert(name.clone(), self.launch(settings));
                    report.added.push(name);
                }
            }
        }

        let bridge = self.outputs.bridge();
        let pruned = self
            .outputs
            .current()
            .reset_from(&new, |topic| bridge.resolve(topic));
        state.config = Some(new);

        info!(
            unchanged = report.unchanged.len(),
            added = ?report.added,
            removed = ?report.removed,
            restarted = ?report.restarted,
            pruned,
            "Configuration applied"
        );

        Ok(report)
    }

    fn launch(&self, settings: LineSettings) -> RunningLine {
        let handle =
            LineScheduler::new(settings.clone(), self.opener.clone(), self.outputs.clone()).spawn();
        RunningLine { settings, handle }
    }

    /// Stop every line and wait for their tasks.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        for (_, line) in state.lines.drain() {
            line.handle.stop().await;
        }
        info!("All lines stopped");
    }

    /// Names of running lines, sorted.
    pub async fn running_lines(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut names: Vec<String> = state.lines.keys().cloned().collect();
        names.sort();
        names
    }

    /// The configuration currently applied.
    pub async fn config(&self) -> Option<GatewayConfig> {
        self.state.lock().await.config.clone()
    }
}
