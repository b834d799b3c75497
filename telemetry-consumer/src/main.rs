//! Telemetry Consumer - point server with self-monitoring
//!
//! Publishes the shared start time, serves as the point server for the
//! configured duration and records its own CPU/memory load to
//! `server_resources.json`.

use anyhow::{Context, Result};
use std::time::Duration;
use telemetry_core::lifecycle::RunOutcome;
use telemetry_core::logging::init_logging;
use telemetry_core::protocol::MqttPointSession;
use telemetry_core::{run_consumer, Role, SystemProbe, TelemetryConfig};
use tracing::{error, info, warn, Instrument};

#[tokio::main]
async fn main() -> Result<()> {
    let (config, config_source) = TelemetryConfig::load().context("Failed to load telemetry config")?;
    init_logging(&config.resource_log_path(Role::Consumer)).context("Failed to initialise logging")?;

    let span = Role::Consumer.span();
    async move {
        info!("Telemetry consumer starting...");
        config_source.log();

        let session = MqttPointSession::server(config.endpoint.clone());
        let probe = SystemProbe::new(Duration::from_millis(config.monitor.sampling_window_ms));
        let shutdown = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("cannot listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        match run_consumer(&config, session, probe, shutdown).await {
            Ok(summary) => {
                match summary.outcome {
                    RunOutcome::Completed(report) => info!(
                        "done: served {:?}, {} updates received",
                        report.served, report.received
                    ),
                    RunOutcome::Interrupted => info!("interrupted"),
                }
                info!("{} resource samples recorded", summary.monitor.samples_recorded);
                Ok(())
            }
            Err(e) => {
                error!("consumer failed ({:?})", e.kind());
                Err(e).context("Consumer run failed")
            }
        }
    }
    .instrument(span)
    .await
}
