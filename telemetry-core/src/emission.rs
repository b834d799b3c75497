//! Paced emission loop (producer role)
//!
//! Every pass assigns a fresh value to each point and transmits it. Passes
//! start on a fixed wall-clock cadence: a short pass sleeps off the rest of
//! its slot, an overrunning pass is followed immediately by the next one.

use crate::config::ProducerConfig;
use crate::error::ProtocolError;
use crate::handshake::ElapsedClock;
use crate::protocol::{Cause, Point, PointSession};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Source of the next value for a point
pub trait ValueGenerator: Send {
    fn next_value(&mut self, point: &Point) -> f64;
}

impl<F> ValueGenerator for F
where
    F: FnMut(&Point) -> f64 + Send,
{
    fn next_value(&mut self, point: &Point) -> f64 {
        self(point)
    }
}

/// Uniform random values in `[low, high]`
pub struct UniformValues {
    rng: StdRng,
    low: f64,
    high: f64,
}

impl UniformValues {
    pub fn new(low: f64, high: f64) -> Self {
        Self::with_rng(StdRng::from_entropy(), low, high)
    }

    pub fn seeded(seed: u64, low: f64, high: f64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed), low, high)
    }

    fn with_rng(rng: StdRng, low: f64, high: f64) -> Self {
        let (low, high) = if low <= high { (low, high) } else { (high, low) };
        Self { rng, low, high }
    }
}

impl ValueGenerator for UniformValues {
    fn next_value(&mut self, _point: &Point) -> f64 {
        self.rng.gen_range(self.low..=self.high)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunLimit {
    Passes(u64),
    /// Passes keep starting until this much time has gone by
    Duration(Duration),
}

#[derive(Debug, Clone)]
pub struct EmissionPlan {
    pub cadence: Duration,
    pub limit: RunLimit,
    pub cause: Cause,
    /// Yield to the runtime after this many transmissions
    pub batch_size: Option<usize>,
    /// Log one transmission out of this many
    pub log_every_nth: u64,
}

impl EmissionPlan {
    pub fn from_config(config: &ProducerConfig) -> Self {
        let limit = match config.run_duration_secs {
            Some(secs) => RunLimit::Duration(Duration::from_secs(secs)),
            None => RunLimit::Passes(config.passes),
        };

        Self {
            cadence: Duration::from_secs_f64(config.cadence_secs),
            limit,
            cause: config.cause,
            batch_size: config.batch_size.filter(|n| *n > 0),
            log_every_nth: config.log_every_nth.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmissionReport {
    pub passes: u64,
    pub transmitted: u64,
    /// Passes that took longer than the cadence
    pub overruns: u64,
    pub slept: Duration,
}

/// Time left in a cadence slot, `None` when the pass used all of it
pub fn pace_remainder(elapsed: Duration, cadence: Duration) -> Option<Duration> {
    cadence.checked_sub(elapsed).filter(|rest| !rest.is_zero())
}

pub struct PacedEmissionLoop<G> {
    points: Vec<Point>,
    generator: G,
    plan: EmissionPlan,
    clock: ElapsedClock,
}

impl<G: ValueGenerator> PacedEmissionLoop<G> {
    pub fn new(points: Vec<Point>, generator: G, plan: EmissionPlan, clock: ElapsedClock) -> Self {
        Self { points, generator, plan, clock }
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    /// Run passes until the plan's limit is reached or a transmit fails
    pub async fn run<S: PointSession>(&mut self, session: &S) -> Result<EmissionReport, ProtocolError> {
        let started = Instant::now();
        let mut report = EmissionReport::default();

        info!(
            "emitting {} points every {:?} ({:?})",
            self.points.len(),
            self.plan.cadence,
            self.plan.limit
        );

        while self.should_continue(&report, started) {
            let pass_started = Instant::now();
            self.run_pass(session, &mut report).await?;
            report.passes += 1;

            let elapsed = pass_started.elapsed();
            match pace_remainder(elapsed, self.plan.cadence) {
                Some(rest) => {
                    debug!(
                        "pass {} done at t={}s in {:?}, sleeping {:?}",
                        report.passes,
                        self.clock.elapsed_secs(),
                        elapsed,
                        rest
                    );
                    tokio::time::sleep(rest).await;
                    report.slept += rest;
                }
                None => {
                    report.overruns += 1;
                    warn!(
                        "pass {} took {:?}, over the {:?} cadence",
                        report.passes, elapsed, self.plan.cadence
                    );
                }
            }
        }

        info!(
            "emission finished: {} passes, {} values sent, {} overruns",
            report.passes, report.transmitted, report.overruns
        );
        Ok(report)
    }

    fn should_continue(&self, report: &EmissionReport, started: Instant) -> bool {
        match self.plan.limit {
            RunLimit::Passes(max) => report.passes < max,
            RunLimit::Duration(max) => started.elapsed() < max,
        }
    }

    async fn run_pass<S: PointSession>(&mut self, session: &S, report: &mut EmissionReport) -> Result<(), ProtocolError> {
        for (index, point) in self.points.iter_mut().enumerate() {
            point.value = self.generator.next_value(point);

            if let Err(e) = session.transmit(point, self.plan.cause).await {
                error!(
                    "transmit of point {} failed in pass {}: {}",
                    point.address,
                    report.passes + 1,
                    e
                );
                return Err(e);
            }
            report.transmitted += 1;

            if report.transmitted % self.plan.log_every_nth == 0 {
                info!("Sent value {:.2} to point {}", point.value, point.address);
            }

            if let Some(batch) = self.plan.batch_size {
                if (index + 1) % batch == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }
        Ok(())
    }
}
