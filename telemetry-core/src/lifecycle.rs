/**
 * PROCESS LIFECYCLE - Startup, steady state and guaranteed teardown
 *
 * ROLE :
 * Drives one role process from a configured point session to a clean exit.
 *
 * SEQUENCE :
 * 1. session.start()
 * 2. wait until the session is running AND connected (startup-fatal otherwise)
 * 3. start the resource monitor (baseline sample first)
 * 4. run the role loop until it completes, fails, or shutdown fires
 * 5. stop the monitor (bounded join), then stop the session
 *
 * Step 5 runs on every exit path that got past step 3.
 */

use crate::config::Role;
use crate::error::{error_chain, ProtocolError, TelemetryError};
use crate::monitor::{ResourceMonitor, StopReport};
use crate::protocol::PointSession;
use crate::sampler::ResourceProbe;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const READY_POLL: Duration = Duration::from_millis(100);

/// Foreground work of a role, run against a started session
pub trait RoleLoop<S: PointSession>: Send {
    type Output: Send;

    fn drive(&mut self, session: &S) -> impl Future<Output = Result<Self::Output, TelemetryError>> + Send;
}

/// Consumer foreground: keep the process up while callbacks do the work
#[derive(Debug, Clone, Copy)]
pub struct PassiveWait {
    duration: Duration,
    check_every: Duration,
}

impl PassiveWait {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            check_every: Duration::from_secs(1),
        }
    }
}

impl<S: PointSession> RoleLoop<S> for PassiveWait {
    type Output = Duration;

    async fn drive(&mut self, session: &S) -> Result<Duration, TelemetryError> {
        let started = Instant::now();
        let deadline = started + self.duration;
        info!("serving for {:?}", self.duration);

        loop {
            if !session.is_running() {
                return Err(ProtocolError::Session("point session stopped unexpectedly".into()).into());
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(self.check_every.min(deadline - now)).await;
        }

        Ok(started.elapsed())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome<T> {
    Completed(T),
    /// Shutdown fired before the role loop finished
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary<T> {
    pub outcome: RunOutcome<T>,
    pub monitor: StopReport,
}

pub struct Lifecycle<S> {
    role: Role,
    session: S,
    ready_timeout: Duration,
}

impl<S: PointSession> Lifecycle<S> {
    pub fn new(role: Role, session: S, ready_timeout: Duration) -> Self {
        Self {
            role,
            session,
            ready_timeout,
        }
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub async fn run<P, L, F>(
        mut self,
        monitor: ResourceMonitor<P>,
        mut role_loop: L,
        shutdown: F,
    ) -> Result<RunSummary<L::Output>, TelemetryError>
    where
        P: ResourceProbe + 'static,
        L: RoleLoop<S>,
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        info!("{} starting", self.role);

        let ready = tokio::select! {
            result = self.start_session() => Some(result),
            _ = &mut shutdown => None,
        };

        let Some(ready) = ready else {
            info!("interrupted during startup");
            self.stop_session().await;
            return Ok(RunSummary {
                outcome: RunOutcome::Interrupted,
                monitor: StopReport { joined: true, samples_recorded: 0, failures: 0 },
            });
        };

        if let Err(e) = ready {
            error!("{} failed to start ({:?}): {}", self.role, e.kind(), error_chain(&e));
            self.stop_session().await;
            return Err(e.into());
        }

        let monitor = monitor.start().await;

        let outcome = tokio::select! {
            result = role_loop.drive(&self.session) => result.map(RunOutcome::Completed),
            _ = &mut shutdown => {
                info!("shutdown requested");
                Ok(RunOutcome::Interrupted)
            }
        };

        if let Err(e) = &outcome {
            error!("{} loop aborted ({:?}): {}", self.role, e.kind(), error_chain(e));
        }

        let report = monitor.stop().await;
        if !report.joined {
            warn!("resource monitor was not joined cleanly");
        }
        self.stop_session().await;

        info!("{} stopped", self.role);
        outcome.map(|outcome| RunSummary { outcome, monitor: report })
    }

    async fn start_session(&mut self) -> Result<(), ProtocolError> {
        self.session
            .start()
            .await
            .map_err(|e| ProtocolError::StartFailed(Box::new(e)))?;

        let deadline = Instant::now() + self.ready_timeout;
        loop {
            if self.session.is_running() && self.session.is_connected() {
                info!("point session ready (station {})", self.session.common_address());
                return Ok(());
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(READY_POLL).await;
        }

        if self.session.is_running() {
            Err(ProtocolError::NotConnected(self.ready_timeout))
        } else {
            Err(ProtocolError::NotRunning)
        }
    }

    async fn stop_session(&mut self) {
        match self.session.stop().await {
            Ok(()) => debug!("point session stopped"),
            Err(e) => warn!("point session did not stop cleanly: {}", e),
        }
    }
}
