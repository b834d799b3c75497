//! Telemetry Producer - paced point emission with self-monitoring
//!
//! Waits for the consumer's start time, connects as a point client, then
//! transmits a fresh value for every configured point once per cadence
//! while recording its own CPU/memory load to `client_resources.json`.

use anyhow::{Context, Result};
use std::time::Duration;
use telemetry_core::lifecycle::RunOutcome;
use telemetry_core::logging::init_logging;
use telemetry_core::protocol::MqttPointSession;
use telemetry_core::{run_producer, Role, SystemProbe, TelemetryConfig};
use tracing::{error, info, warn, Instrument};

#[tokio::main]
async fn main() -> Result<()> {
    let (config, config_source) = TelemetryConfig::load().context("Failed to load telemetry config")?;
    init_logging(&config.resource_log_path(Role::Producer)).context("Failed to initialise logging")?;

    let span = Role::Producer.span();
    async move {
        info!("Telemetry producer starting...");
        config_source.log();

        let session = MqttPointSession::client(config.endpoint.clone());
        let probe = SystemProbe::new(Duration::from_millis(config.monitor.sampling_window_ms));
        let shutdown = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("cannot listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        match run_producer(&config, session, probe, shutdown).await {
            Ok(summary) => {
                match summary.outcome {
                    RunOutcome::Completed(report) => info!(
                        "done: {} passes, {} values, {} overruns, slept {:?}",
                        report.passes, report.transmitted, report.overruns, report.slept
                    ),
                    RunOutcome::Interrupted => info!("interrupted"),
                }
                info!("{} resource samples recorded", summary.monitor.samples_recorded);
                Ok(())
            }
            Err(e) => {
                error!("producer failed ({:?})", e.kind());
                Err(e).context("Producer run failed")
            }
        }
    }
    .instrument(span)
    .await
}
