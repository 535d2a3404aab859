//! rtugate: Modbus RTU to MQTT gateway.
//!
//! Polls the serial lines of the configuration file and publishes parameter
//! values to MQTT. Send `SIGHUP` to reload the configuration file.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mqtt_bridge_modbus::{
    AlertDispatcher, CurrentStateCache, GatewayConfig, HistoryStore, HistoryWriter,
    HotReloadManager, HttpAlertSender, MqttBridge, Outputs, SerialPortOpener,
};
use rtugate_bridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};
use tracing::{error, info, warn};

/// Time given to the history writer to flush its queue on shutdown.
const HISTORY_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Time given to an alert delivery in progress on shutdown.
const ALERTS_STOP_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    let args = BridgeArgs::parse_with_default("rtugate.json5");

    let config = GatewayConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    if args.check {
        let params: usize = config
            .lines
            .iter()
            .flat_map(|l| &l.nodes)
            .map(|n| n.params.len())
            .sum();
        println!(
            "{}: OK ({} line(s), {} parameter(s))",
            args.config.display(),
            config.lines.len(),
            params
        );
        return Ok(());
    }

    let runner = BridgeRunner::new_with_args("modbus", config.clone(), Some(&args))
        .await?
        .with_status_publishing();

    let store = Arc::new(
        HistoryStore::open(&config.db)
            .await
            .with_context(|| format!("Failed to open history database {}", config.db.url))?,
    );
    let (history, writer_task) =
        HistoryWriter::spawn(store.clone(), config.db.history.queue_capacity);
    let history = Arc::new(history);

    let sender = HttpAlertSender::new().context("Failed to create alert HTTP client")?;
    let (alerts, alerts_task) = AlertDispatcher::spawn(config.alerts.clone(), Arc::new(sender));

    let outputs = Outputs::new(
        CurrentStateCache::new(),
        MqttBridge::from_publisher(runner.publisher()),
        history.clone(),
    )
    .with_alerts(alerts);
    let manager = HotReloadManager::new(Arc::new(SerialPortOpener), outputs);

    manager.start(config).await?;

    runner
        .start(Some(serde_json::json!({
            "lines": manager.running_lines().await,
        })))
        .await;

    let manager_ref = &manager;
    let config_path = &args.config;
    runner
        .wait_for_shutdown(move || async move {
            match GatewayConfig::load(config_path) {
                Ok(new) => match manager_ref.reload(new).await {
                    Ok(report) if report.is_noop() => info!("Configuration unchanged"),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Reload rejected, keeping current configuration"),
                },
                Err(e) => error!(error = %e, "Reload failed, keeping current configuration"),
            }
        })
        .await?;

    manager.shutdown().await;
    drop(manager);

    // The writer exits once the last queue handle is gone.
    let dropped = history.dropped();
    drop(history);
    if dropped > 0 {
        warn!(dropped, "History events were dropped on a full queue");
    }

    if tokio::time::timeout(HISTORY_FLUSH_TIMEOUT, writer_task)
        .await
        .is_err()
    {
        warn!("History writer did not drain in time");
    }
    store.close().await;

    // The dispatcher went away with the manager's outputs.
    if tokio::time::timeout(ALERTS_STOP_TIMEOUT, alerts_task)
        .await
        .is_err()
    {
        warn!("Alert dispatcher did not stop in time");
    }

    runner.shutdown().await?;

    Ok(())
}
