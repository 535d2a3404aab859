//! Grouped alert notifications.
//!
//! Every emitted value is offered to the configured flows. A flow picks the
//! parameters listed in its `include` filter, skips the ones matching an
//! exception value, and collects the rest for `group_window_s` seconds before
//! sending one message for the whole group.
//!
//! ```text
//! alerts: {
//!   flows: [{
//!     id: "leaks", name: "Leak alarms", type: "telegram",
//!     telegram: { bot_token: "123:AA", chat_id: "-100" },
//!     params: [{ line: "line1", unit_id: 1, name: "q1", alias: "Bathroom leak",
//!                location: "Site/Building 1/Flat 3", nominal: 0,
//!                ok_text: "dry", alarm_text: "LEAK" }],
//!     events: { group_window_s: 20, include: [{ line: "line1", unit_id: 1, name: "q1" }] },
//!   }],
//! }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, ParamKey};

/// Why a value was published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    /// A change, a recovery or a heartbeat.
    Event,
    /// A periodic republish of an unchanged value.
    Interval,
}

/// One published value, as seen by the alert flows.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub key: ParamKey,
    pub value: Option<String>,
    pub trigger: Trigger,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
}

// Configuration

fn default_true() -> bool {
    true
}

fn default_window_s() -> u64 {
    30
}

fn default_ok_text() -> String {
    "OK".to_string()
}

fn default_alarm_text() -> String {
    "ALARM".to_string()
}

fn default_queue_capacity() -> usize {
    1024
}

/// The `alerts` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertsConfig {
    #[serde(default)]
    pub flows: Vec<FlowConfig>,

    /// Notifications waiting for the dispatcher.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            flows: Vec::new(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Delivery channel of a flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    #[default]
    Telegram,
    Ronet,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelegramTarget {
    pub bot_token: String,
    pub chat_id: String,
}

/// Generic HTTP endpoint receiving `{"text": ...}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RonetTarget {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

/// One notification flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    pub id: String,

    /// Display name; the id when empty.
    #[serde(default)]
    pub name: String,

    #[serde(rename = "type", default)]
    pub kind: ChannelKind,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub telegram: Option<TelegramTarget>,

    #[serde(default)]
    pub ronet: Option<RonetTarget>,

    /// How parameters are named and judged in messages.
    #[serde(default)]
    pub params: Vec<FlowParam>,

    /// Filter for change-driven publishes.
    #[serde(default)]
    pub events: FlowFilter,

    /// Filter for periodic republishes.
    #[serde(default)]
    pub intervals: FlowFilter,
}

impl FlowConfig {
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    fn filter(&self, trigger: Trigger) -> &FlowFilter {
        match trigger {
            Trigger::Event => &self.events,
            Trigger::Interval => &self.intervals,
        }
    }

    fn param(&self, key: &ParamKey) -> Option<&FlowParam> {
        self.params.iter().find(|p| p.matches(key))
    }

    /// Whether the flow wants `notification`.
    pub fn accepts(&self, notification: &Notification) -> bool {
        if !self.enabled {
            return false;
        }
        let filter = self.filter(notification.trigger);
        let key = &notification.key;
        if !filter.include.iter().any(|r| r.matches(key)) {
            return false;
        }
        let value = notification
            .value
            .as_deref()
            .and_then(|v| v.trim().parse::<f64>().ok());
        !filter
            .exceptions
            .iter()
            .any(|ex| ex.matches(key) && value == Some(ex.value))
    }
}

/// Reference to a configured parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamRef {
    pub line: String,
    pub unit_id: u8,
    pub name: String,
}

impl ParamRef {
    pub fn matches(&self, key: &ParamKey) -> bool {
        self.line == key.line && self.unit_id == key.unit_id && self.name == key.param
    }
}

/// Suppresses a parameter while it reads exactly `value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamException {
    pub line: String,
    pub unit_id: u8,
    pub name: String,
    pub value: f64,
}

impl ParamException {
    pub fn matches(&self, key: &ParamKey) -> bool {
        self.line == key.line && self.unit_id == key.unit_id && self.name == key.param
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowFilter {
    #[serde(default = "default_window_s")]
    pub group_window_s: u64,
    #[serde(default)]
    pub include: Vec<ParamRef>,
    #[serde(default)]
    pub exceptions: Vec<ParamException>,
}

impl Default for FlowFilter {
    fn default() -> Self {
        Self {
            group_window_s: default_window_s(),
            include: Vec::new(),
            exceptions: Vec::new(),
        }
    }
}

impl FlowFilter {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.group_window_s.max(1))
    }
}

/// Presentation of one parameter in a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowParam {
    pub line: String,
    pub unit_id: u8,
    pub name: String,

    /// Name shown in messages; the parameter name when absent.
    #[serde(default)]
    pub alias: Option<String>,

    /// Slash-separated place, e.g. `"Site/Building 1/Flat 3"`.
    #[serde(default)]
    pub location: String,

    /// Normal reading: 0 or 1 for bits, a number for analog values.
    #[serde(default)]
    pub nominal: Option<f64>,

    /// Allowed distance from `nominal` for analog values.
    #[serde(default)]
    pub tolerance: Option<f64>,

    #[serde(default = "default_ok_text")]
    pub ok_text: String,

    #[serde(default = "default_alarm_text")]
    pub alarm_text: String,
}

impl FlowParam {
    pub fn matches(&self, key: &ParamKey) -> bool {
        self.line == key.line && self.unit_id == key.unit_id && self.name == key.param
    }

    fn is_bit(&self) -> bool {
        matches!(self.nominal, Some(n) if n == 0.0 || n == 1.0)
            && self.tolerance.is_none_or(|t| t == 0.0)
    }

    /// `true` when `value` is the normal reading.
    pub fn is_ok(&self, value: Option<f64>) -> bool {
        let Some(value) = value else {
            return false;
        };
        let nominal = self.nominal.unwrap_or(0.0);
        if self.is_bit() {
            value.round() == nominal
        } else {
            (value - nominal).abs() <= self.tolerance.unwrap_or(0.0)
        }
    }

    /// State text, with the reading as a percentage of nominal for analog alarms.
    pub fn state_text(&self, value: Option<f64>) -> String {
        if self.is_ok(value) {
            return self.ok_text.clone();
        }
        match (self.is_bit(), value, self.nominal) {
            (false, Some(value), Some(nominal)) if nominal != 0.0 => {
                let pct = ((value / nominal) * 100.0).round().clamp(0.0, 999.0);
                format!("{} ({}%)", self.alarm_text, pct as u32)
            }
            _ => self.alarm_text.clone(),
        }
    }
}

impl AlertsConfig {
    pub(crate) fn check(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::invalid("alerts.queue_capacity must be at least 1"));
        }

        let mut ids = HashSet::new();
        for flow in &self.flows {
            if flow.id.trim().is_empty() {
                return Err(ConfigError::invalid("alerts: flow id cannot be empty"));
            }
            if !ids.insert(flow.id.as_str()) {
                return Err(ConfigError::invalid(format!(
                    "alerts: duplicate flow id '{}'",
                    flow.id
                )));
            }
            if !flow.enabled {
                continue;
            }
            let target_ok = match flow.kind {
                ChannelKind::Telegram => flow
                    .telegram
                    .as_ref()
                    .is_some_and(|t| !t.bot_token.is_empty() && !t.chat_id.is_empty()),
                ChannelKind::Ronet => flow
                    .ronet
                    .as_ref()
                    .is_some_and(|r| !r.endpoint.is_empty()),
            };
            if !target_ok {
                return Err(ConfigError::invalid(format!(
                    "alerts: flow '{}' has no {:?} target",
                    flow.id, flow.kind
                )));
            }
        }
        Ok(())
    }
}

// Message rendering

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[derive(Default)]
struct LocationTree {
    children: BTreeMap<String, LocationTree>,
    items: Vec<String>,
}

impl LocationTree {
    fn insert(&mut self, path: &[String], leaf: String) {
        match path.split_first() {
            Some((head, rest)) => self.children.entry(head.clone()).or_default().insert(rest, leaf),
            None => self.items.push(leaf),
        }
    }

    fn render(&self, level: usize, out: &mut Vec<String>) {
        let indent = " ".repeat(level * 2);
        for (name, child) in &self.children {
            out.push(format!("{indent}<b>{}</b>", escape_html(name)));
            child.render(level + 1, out);
        }
        for item in &self.items {
            out.push(format!("{indent}• {item}"));
        }
    }
}

/// HTML message for one group, grouped by location.
///
/// Parameters the flow does not describe are left out; `None` when nothing
/// remains.
pub fn render_message(flow: &FlowConfig, trigger: Trigger, items: &[Notification]) -> Option<String> {
    let mut tree = LocationTree::default();
    let mut count = 0;

    for item in items {
        let Some(param) = flow.param(&item.key) else {
            continue;
        };
        let value = item.value.as_deref().and_then(|v| v.trim().parse::<f64>().ok());
        let alias = param.alias.as_deref().unwrap_or(&param.name);
        let leaf = format!(
            "<b>{}</b> - {}",
            escape_html(alias),
            escape_html(&param.state_text(value))
        );

        let mut path: Vec<String> = param
            .location
            .split('/')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if path.is_empty() {
            path.push("Object".to_string());
        }

        tree.insert(&path, leaf);
        count += 1;
    }

    if count == 0 {
        return None;
    }

    let title = match trigger {
        Trigger::Event => "Events",
        Trigger::Interval => "Interval report",
    };
    let mut lines = vec![
        format!("<b>{}</b>", escape_html(flow.display_name())),
        format!("<b>{title}</b>"),
        String::new(),
    ];
    tree.render(0, &mut lines);
    Some(lines.join("\n"))
}

// Delivery

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Endpoint answered {status}")]
    Rejected { status: u16 },

    #[error("Flow '{0}' has no delivery target")]
    MissingTarget(String),
}

/// Delivers a rendered message for a flow.
#[async_trait]
pub trait AlertSender: Send + Sync {
    async fn send(&self, flow: &FlowConfig, text: &str) -> Result<(), AlertError>;
}

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Telegram Bot API and generic JSON endpoints over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpAlertSender {
    client: reqwest::Client,
}

impl HttpAlertSender {
    pub fn new() -> Result<Self, AlertError> {
        let client = reqwest::Client::builder().timeout(SEND_TIMEOUT).build()?;
        Ok(Self { client })
    }

    async fn send_telegram(&self, target: &TelegramTarget, text: &str) -> Result<(), AlertError> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", target.bot_token);
        let response = self
            .client
            .post(url)
            .form(&[
                ("chat_id", target.chat_id.as_str()),
                ("text", text),
                ("parse_mode", "HTML"),
                ("disable_web_page_preview", "true"),
            ])
            .send()
            .await?;
        check_status(response.status())
    }

    async fn send_ronet(&self, target: &RonetTarget, text: &str) -> Result<(), AlertError> {
        let mut request = self
            .client
            .post(&target.endpoint)
            .json(&serde_json::json!({ "text": text }));
        if let Some(ref key) = target.api_key {
            request = request.bearer_auth(key);
        }
        check_status(request.send().await?.status())
    }
}

fn check_status(status: reqwest::StatusCode) -> Result<(), AlertError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(AlertError::Rejected {
            status: status.as_u16(),
        })
    }
}

#[async_trait]
impl AlertSender for HttpAlertSender {
    async fn send(&self, flow: &FlowConfig, text: &str) -> Result<(), AlertError> {
        match (flow.kind, &flow.telegram, &flow.ronet) {
            (ChannelKind::Telegram, Some(target), _) => self.send_telegram(target, text).await,
            (ChannelKind::Ronet, _, Some(target)) => self.send_ronet(target, text).await,
            _ => Err(AlertError::MissingTarget(flow.id.clone())),
        }
    }
}

// Dispatcher

/// Notifications collected for one flow and trigger.
struct Bucket {
    trigger: Trigger,
    items: Vec<Notification>,
    deadline: Option<Instant>,
}

impl Bucket {
    fn new(trigger: Trigger) -> Self {
        Self {
            trigger,
            items: Vec::new(),
            deadline: None,
        }
    }
}

struct FlowRuntime {
    flow: FlowConfig,
    buckets: [Bucket; 2],
}

impl FlowRuntime {
    fn new(flow: FlowConfig) -> Self {
        Self {
            flow,
            buckets: [Bucket::new(Trigger::Event), Bucket::new(Trigger::Interval)],
        }
    }

    fn offer(&mut self, notification: &Notification, now: Instant) {
        if !self.flow.accepts(notification) {
            return;
        }
        let window = self.flow.filter(notification.trigger).window();
        let bucket = match notification.trigger {
            Trigger::Event => &mut self.buckets[0],
            Trigger::Interval => &mut self.buckets[1],
        };
        bucket.items.push(notification.clone());
        bucket.deadline.get_or_insert(now + window);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.buckets.iter().filter_map(|b| b.deadline).min()
    }

    fn pending(&self) -> usize {
        self.buckets.iter().map(|b| b.items.len()).sum()
    }

    /// Rendered messages of every bucket whose window has closed.
    fn take_due(&mut self, now: Instant) -> Vec<String> {
        let mut messages = Vec::new();
        for bucket in &mut self.buckets {
            if bucket.deadline.is_some_and(|d| d <= now) {
                bucket.deadline = None;
                let items = std::mem::take(&mut bucket.items);
                if let Some(text) = render_message(&self.flow, bucket.trigger, &items) {
                    messages.push(text);
                }
            }
        }
        messages
    }
}

enum Command {
    Notify(Notification),
    Reload(AlertsConfig),
}

/// Queue in front of the alert flows, drained by one dispatcher task.
#[derive(Debug, Clone)]
pub struct AlertDispatcher {
    tx: mpsc::Sender<Command>,
    dropped: Arc<AtomicU64>,
}

impl AlertDispatcher {
    /// Start the dispatcher task. It ends once every handle is dropped;
    /// groups still collecting at that point are discarded.
    pub fn spawn(config: AlertsConfig, sender: Arc<dyn AlertSender>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let handle = tokio::spawn(dispatch(config, sender, rx));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            handle,
        )
    }

    /// Offer a published value to the flows without waiting.
    pub fn notify(&self, notification: Notification) {
        match self.tx.try_send(Command::Notify(notification)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped, "Alert queue full, notification dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Alert dispatcher closed, notification dropped");
            }
        }
    }

    /// Replace the flows; groups still collecting are discarded.
    pub async fn reload(&self, config: AlertsConfig) {
        if self.tx.send(Command::Reload(config)).await.is_err() {
            debug!("Alert dispatcher closed, reload ignored");
        }
    }

    /// Notifications dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn runtimes(config: AlertsConfig) -> Vec<FlowRuntime> {
    config.flows.into_iter().map(FlowRuntime::new).collect()
}

async fn dispatch(config: AlertsConfig, sender: Arc<dyn AlertSender>, mut rx: mpsc::Receiver<Command>) {
    let mut flows = runtimes(config);
    info!(flows = flows.len(), "Alert dispatcher started");

    loop {
        let deadline = flows.iter().filter_map(FlowRuntime::next_deadline).min();

        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Notify(notification)) => {
                    let now = Instant::now();
                    for flow in &mut flows {
                        flow.offer(&notification, now);
                    }
                }
                Some(Command::Reload(config)) => {
                    flows = runtimes(config);
                    info!(flows = flows.len(), "Alert flows reloaded");
                }
                None => break,
            },
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                let now = Instant::now();
                for flow in &mut flows {
                    for text in flow.take_due(now) {
                        if let Err(e) = sender.send(&flow.flow, &text).await {
                            warn!(flow = %flow.flow.id, error = %e, "Failed to send alert");
                        }
                    }
                }
            }
        }
    }

    let pending: usize = flows.iter().map(FlowRuntime::pending).sum();
    debug!(pending, "Alert dispatcher stopped");
}
