//! Role runners
//!
//! Wire config, handshake, session, store, monitor and lifecycle together for
//! each side of the pair. Generic over the session and the probe so the same
//! code runs against a broker or against test doubles.

use crate::config::{Role, TelemetryConfig};
use crate::emission::{EmissionPlan, EmissionReport, PacedEmissionLoop, UniformValues, ValueGenerator};
use crate::error::TelemetryError;
use crate::handshake::StartTimeHandshake;
use crate::ingest::PointIngestHandler;
use crate::lifecycle::{Lifecycle, PassiveWait, RoleLoop, RunSummary};
use crate::monitor::{MonitorSettings, ResourceMonitor};
use crate::protocol::{Point, PointSession};
use crate::sampler::ResourceProbe;
use crate::store::{RetryPolicy, TimeSeriesStore};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

impl<S: PointSession, G: ValueGenerator> RoleLoop<S> for PacedEmissionLoop<G> {
    type Output = EmissionReport;

    async fn drive(&mut self, session: &S) -> Result<EmissionReport, TelemetryError> {
        Ok(self.run(session).await?)
    }
}

/// What the consumer saw while it was serving
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestReport {
    pub served: Duration,
    pub received: u64,
}

struct ConsumerLoop {
    wait: PassiveWait,
    handler: Arc<PointIngestHandler>,
}

impl<S: PointSession> RoleLoop<S> for ConsumerLoop {
    type Output = IngestReport;

    async fn drive(&mut self, session: &S) -> Result<IngestReport, TelemetryError> {
        let served = self.wait.drive(session).await?;
        Ok(IngestReport {
            served,
            received: self.handler.received(),
        })
    }
}

pub fn role_store(config: &TelemetryConfig, role: Role) -> TimeSeriesStore {
    TimeSeriesStore::new(config.store_path(role)).with_retry_policy(RetryPolicy {
        attempts: config.storage.retry_attempts,
        backoff: Duration::from_millis(config.storage.retry_backoff_ms),
    })
}

/// Producer: wait for t0, register points, emit on cadence
pub async fn run_producer<S, P, F>(
    config: &TelemetryConfig,
    session: S,
    probe: P,
    shutdown: F,
) -> Result<RunSummary<EmissionReport>, TelemetryError>
where
    S: PointSession,
    P: ResourceProbe + 'static,
    F: Future<Output = ()> + Send,
{
    let generator = UniformValues::new(config.producer.value_min, config.producer.value_max);
    run_producer_with(config, session, probe, generator, shutdown).await
}

/// Producer with a caller-supplied value generator
pub async fn run_producer_with<S, P, G, F>(
    config: &TelemetryConfig,
    mut session: S,
    probe: P,
    generator: G,
    shutdown: F,
) -> Result<RunSummary<EmissionReport>, TelemetryError>
where
    S: PointSession,
    P: ResourceProbe + 'static,
    G: ValueGenerator,
    F: Future<Output = ()> + Send,
{
    let role = Role::Producer;
    let handshake = StartTimeHandshake::new(config.handshake_path());
    let time_base = handshake.establish(role, config.handshake_max_wait()).await;
    info!("t0 = {:.3} ({:?})", time_base.t0_epoch, time_base.source);

    let point_type = config.points.point_type;
    let mut points = Vec::with_capacity(config.points.count as usize);
    for address in config.point_addresses() {
        session.add_point(address, point_type)?;
        points.push(Point::new(address, point_type));
    }
    info!("registered {} {} points", points.len(), point_type.type_id());

    let monitor = ResourceMonitor::new(
        probe,
        Arc::new(role_store(config, role)),
        time_base.clock(),
        MonitorSettings::from_config(&config.monitor),
    );
    let emission = PacedEmissionLoop::new(
        points,
        generator,
        EmissionPlan::from_config(&config.producer),
        time_base.clock(),
    );

    Lifecycle::new(role, session, config.connect_wait())
        .run(monitor, emission, shutdown)
        .await
}

/// Consumer: publish t0, register points with the ingest handler, serve
pub async fn run_consumer<S, P, F>(
    config: &TelemetryConfig,
    mut session: S,
    probe: P,
    shutdown: F,
) -> Result<RunSummary<IngestReport>, TelemetryError>
where
    S: PointSession,
    P: ResourceProbe + 'static,
    F: Future<Output = ()> + Send,
{
    let role = Role::Consumer;
    let handshake = StartTimeHandshake::new(config.handshake_path());
    let time_base = handshake.establish(role, config.handshake_max_wait()).await;
    info!("t0 = {:.3} ({:?})", time_base.t0_epoch, time_base.source);
    let _cleanup = config.storage.clear_handshake_on_exit.then(|| handshake.clear_on_drop());

    let handler = Arc::new(PointIngestHandler::new(config.consumer.log_every_nth));
    let point_type = config.points.point_type;
    for address in config.point_addresses() {
        session.add_point(address, point_type)?;
        session.on_receive(address, PointIngestHandler::receive_handler(handler.clone()))?;
    }
    info!("registered {} {} points", config.points.count, point_type.type_id());

    let monitor = ResourceMonitor::new(
        probe,
        Arc::new(role_store(config, role)),
        time_base.clock(),
        MonitorSettings::from_config(&config.monitor),
    );
    let serve = ConsumerLoop {
        wait: PassiveWait::new(Duration::from_secs(config.consumer.run_duration_secs)),
        handler: handler.clone(),
    };

    let result = Lifecycle::new(role, session, config.connect_wait())
        .run(monitor, serve, shutdown)
        .await;

    info!("received {} point updates", handler.received());
    result
}
