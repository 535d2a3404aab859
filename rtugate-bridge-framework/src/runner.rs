//! Bridge runner for lifecycle management.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

use rtugate_common::{LoggingConfig, init_tracing};

use crate::BridgeArgs;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::publisher::{Publisher, spawn_event_loop};
use crate::status::StatusPublisher;

/// How long the event loop gets to flush the DISCONNECT on shutdown.
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// Bridge runner that manages the lifecycle of a protocol bridge.
///
/// Initializes logging, owns the MQTT client and its event loop task,
/// publishes the retained bridge status, and waits for Ctrl+C (reloading on
/// SIGHUP).
///
/// # Example
///
/// ```ignore
/// use rtugate_bridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let args = BridgeArgs::parse_with_default("mybridge.json5");
///     let config = MyBridgeConfig::load(&args.config)?;
///
///     let runner = BridgeRunner::new_with_args("mybridge", config, Some(&args)).await?;
///     let worker = tokio::spawn(my_worker(runner.publisher()));
///
///     runner.start(None).await;
///     runner.wait_for_shutdown(|| async {}).await?;
///     worker.abort();
///     runner.shutdown().await
/// }
/// ```
pub struct BridgeRunner<C: BridgeConfig> {
    /// Bridge name for logging and status.
    name: String,
    /// Bridge version.
    version: String,
    /// The loaded configuration.
    config: C,
    /// Publisher for telemetry.
    publisher: Publisher,
    /// Task driving the MQTT connection.
    event_loop: JoinHandle<()>,
    /// Status publisher (optional).
    status_publisher: Option<StatusPublisher>,
}

impl<C: BridgeConfig> BridgeRunner<C> {
    /// Create a new bridge runner with CLI args for log level override.
    ///
    /// This will:
    /// 1. Initialize logging based on config (with optional CLI override)
    /// 2. Create the MQTT client and spawn its event loop
    pub async fn new_with_args(
        name: impl Into<String>,
        config: C,
        args: Option<&BridgeArgs>,
    ) -> Result<Self> {
        let name = name.into();
        let version = env!("CARGO_PKG_VERSION").to_string();

        let log_config = match args.and_then(|a| a.log_level.as_ref()) {
            Some(level) => LoggingConfig {
                level: level.clone(),
                format: config.logging().format,
            },
            None => config.logging().clone(),
        };

        init_tracing(&log_config).map_err(|e| BridgeError::config(e.to_string()))?;

        tracing::info!(bridge = %name, version = %version, "Starting bridge");

        let (publisher, event_loop) = Publisher::connect(config.mqtt())?;
        let event_loop = spawn_event_loop(event_loop);

        tracing::info!(
            host = %config.mqtt().host,
            port = config.mqtt().port,
            base_topic = %publisher.topics().base(),
            "MQTT client created"
        );

        Ok(Self {
            name,
            version,
            config,
            publisher,
            event_loop,
            status_publisher: None,
        })
    }

    /// Enable status publishing.
    ///
    /// When enabled, the runner publishes retained status messages on startup and shutdown.
    pub fn with_status_publishing(mut self) -> Self {
        self.status_publisher = Some(StatusPublisher::new(
            self.publisher.clone(),
            &self.name,
            &self.version,
        ));
        self
    }

    /// Get the bridge name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get a reference to the configuration.
    pub fn config(&self) -> &C {
        &self.config
    }

    /// Get a clone of the publisher.
    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    /// Publish the "running" status (if enabled).
    pub async fn start(&self, metadata: Option<serde_json::Value>) {
        if let Some(ref status_pub) = self.status_publisher {
            if let Err(e) = status_pub.publish_running(metadata) {
                tracing::warn!(error = %e, "Failed to publish running status");
            }
        }

        tracing::info!(bridge = %self.name, "Bridge running. Press Ctrl+C to stop.");
    }

    /// Wait for Ctrl+C, calling `on_reload` on every SIGHUP.
    pub async fn wait_for_shutdown<F, Fut>(&self, mut on_reload: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            let mut hangup = signal(SignalKind::hangup())?;
            loop {
                tokio::select! {
                    res = tokio::signal::ctrl_c() => {
                        if let Err(e) = res {
                            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                        }
                        break;
                    }
                    _ = hangup.recv() => {
                        tracing::info!(bridge = %self.name, "Received SIGHUP, reloading configuration");
                        on_reload().await;
                    }
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = &mut on_reload;
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            }
        }

        tracing::info!(bridge = %self.name, "Received shutdown signal");
        Ok(())
    }

    /// Publish "offline" and disconnect from the broker.
    ///
    /// Bounded by [`DISCONNECT_GRACE`] even when the broker is unreachable
    /// and the request queue is full.
    pub async fn shutdown(self) -> Result<()> {
        if let Some(ref status_pub) = self.status_publisher {
            if let Err(e) = status_pub.publish_offline() {
                tracing::warn!(error = %e, "Failed to publish offline status");
            }
        }

        if let Err(e) = self.publisher.disconnect() {
            tracing::warn!(error = %e, "Error disconnecting from MQTT broker");
        }

        let event_loop = self.event_loop;
        let abort = event_loop.abort_handle();
        if tokio::time::timeout(DISCONNECT_GRACE, event_loop).await.is_err() {
            tracing::debug!("MQTT event loop did not stop in time");
            abort.abort();
        }

        tracing::info!(bridge = %self.name, "Goodbye!");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LoggingConfig, MqttConfig};
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct TestConfig {
        mqtt: MqttConfig,
        #[serde(default)]
        logging: LoggingConfig,
    }

    impl BridgeConfig for TestConfig {
        fn mqtt(&self) -> &MqttConfig {
            &self.mqtt
        }

        fn logging(&self) -> &LoggingConfig {
            &self.logging
        }
    }

    // The only test here that installs the global subscriber.
    #[tokio::test]
    async fn test_shutdown_completes_with_unreachable_broker() {
        let config = TestConfig {
            mqtt: MqttConfig {
                host: "127.0.0.1".to_string(),
                port: 1,
                queue_capacity: 2,
                ..MqttConfig::default()
            },
            logging: LoggingConfig::default(),
        };
        let runner = BridgeRunner::new_with_args("test", config, None)
            .await
            .unwrap()
            .with_status_publishing();

        let publisher = runner.publisher();
        for i in 0..50u8 {
            let _ = publisher.try_publish("/t/fill", vec![i]);
        }
        runner.start(None).await;

        let result = tokio::time::timeout(Duration::from_secs(3), runner.shutdown()).await;
        assert!(matches!(result, Ok(Ok(()))));
    }
}
