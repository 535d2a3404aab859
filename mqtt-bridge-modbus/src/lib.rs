//! Modbus RTU to MQTT gateway.
//!
//! Each configured serial line gets its own polling task. A task reads the
//! parameters of every node on its line (batched when enabled), decides what
//! to publish, and reports silent nodes with heartbeat events. Published
//! values can also feed grouped alert notifications (see [`alerts`]).
//!
//! # Topics
//!
//! ```text
//! <base_topic>/<object>/controls/<param>     default parameter topic
//! /<absolute>/<topic>                        configured absolute topic
//! <base_topic>/@/status                      bridge status (retained)
//! ```
//!
//! # Payload
//!
//! ```text
//! { "value": "21.5" | null,
//!   "metadata": { "timestamp": "...Z",
//!                 "status_code": { "code": 0, "message": "OK", "silent_for_s": 0 } } }
//! ```

pub mod alerts;
pub mod backoff;
pub mod batch;
pub mod bridge;
pub mod config;
pub mod current;
pub mod heartbeat;
pub mod history;
pub mod outputs;
pub mod poller;
pub mod publish;
pub mod reload;
pub mod scheduler;
pub mod transport;

pub use alerts::{AlertDispatcher, HttpAlertSender};
pub use bridge::MqttBridge;
pub use config::{GatewayConfig, LineSettings, ParamKey};
pub use current::{CurrentStateCache, CurrentValue};
pub use history::{EventSink, HistoryStore, HistoryWriter};
pub use outputs::Outputs;
pub use reload::{HotReloadManager, ReloadReport};
pub use scheduler::{LineHandle, LineScheduler};
pub use transport::{PortOpener, RegisterReader, SerialPortOpener};
