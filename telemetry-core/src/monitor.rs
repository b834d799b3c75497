//! Background resource monitor
//!
//! One baseline sample at t=0, then one sample per interval until stopped.
//! Each sample is timestamped against the run's t0 and appended to the
//! role's store. Failures are logged and counted, never propagated.

use crate::config::MonitorConfig;
use crate::error::error_chain;
use crate::handshake::ElapsedClock;
use crate::sampler::{ResourceProbe, ResourceReading, DEFAULT_OVERLOAD_THRESHOLD};
use crate::store::{ResourceSample, TimeSeriesStore, RESOURCE_LOG_TARGET};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    pub interval: Duration,
    pub overload_threshold: f64,
    pub join_timeout: Duration,
}

impl MonitorSettings {
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.sampling_interval_secs.max(1)),
            overload_threshold: config.overload_threshold,
            join_timeout: Duration::from_secs(config.join_timeout_secs),
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            overload_threshold: DEFAULT_OVERLOAD_THRESHOLD,
            join_timeout: Duration::from_secs(10),
        }
    }
}

/// What `stop()` found when it wound the task down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopReport {
    /// false when the task had to be aborted or panicked
    pub joined: bool,
    pub samples_recorded: u64,
    pub failures: u64,
}

#[derive(Default)]
struct Counters {
    recorded: AtomicU64,
    failures: AtomicU64,
}

/// Everything the sampling loop owns
struct Sampling<P> {
    probe: P,
    store: Arc<TimeSeriesStore>,
    clock: ElapsedClock,
    threshold: f64,
    counters: Arc<Counters>,
}

impl<P: ResourceProbe> Sampling<P> {
    async fn sample_and_record(&mut self, timestamp: Option<u64>) {
        match self.probe.sample().await {
            Ok(reading) => {
                let timestamp = timestamp.unwrap_or_else(|| self.clock.elapsed_secs());
                self.record(timestamp, reading).await;
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!("resource sampling failed ({:?}): {}", e.kind(), e);
            }
        }
    }

    async fn record(&mut self, timestamp: u64, reading: ResourceReading) {
        let sample = ResourceSample::new(timestamp, reading, self.threshold);
        let store = self.store.clone();

        match tokio::task::spawn_blocking(move || store.append(sample)).await {
            Ok(Ok(())) => {
                self.counters.recorded.fetch_add(1, Ordering::Relaxed);
                if sample.overload {
                    warn!(
                        target: RESOURCE_LOG_TARGET,
                        "overload at t={}s: cpu={:.1}% mem={:.1}% (threshold {:.0}%)",
                        timestamp,
                        sample.cpu_percent,
                        sample.memory_percent,
                        self.threshold
                    );
                }
            }
            Ok(Err(e)) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                error!("failed to persist sample t={}s ({:?}): {}", timestamp, e.kind(), error_chain(&e));
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                error!("store write task failed: {}", e);
            }
        }
    }
}

/// A monitor that has not been started yet
pub struct ResourceMonitor<P> {
    sampling: Sampling<P>,
    settings: MonitorSettings,
    state: Arc<Mutex<MonitorState>>,
}

impl<P: ResourceProbe + 'static> ResourceMonitor<P> {
    pub fn new(probe: P, store: Arc<TimeSeriesStore>, clock: ElapsedClock, settings: MonitorSettings) -> Self {
        Self {
            sampling: Sampling {
                probe,
                store,
                clock,
                threshold: settings.overload_threshold,
                counters: Arc::new(Counters::default()),
            },
            settings,
            state: Arc::new(Mutex::new(MonitorState::Idle)),
        }
    }

    pub fn state(&self) -> MonitorState {
        *self.state.lock()
    }

    /// Record the baseline, then spawn the periodic loop
    pub async fn start(self) -> MonitorHandle {
        let Self { mut sampling, settings, state } = self;

        // Ticks are anchored here so the baseline's window does not shift them
        let origin = Instant::now();
        sampling.sample_and_record(Some(0)).await;

        let (stop_tx, stop_rx) = watch::channel(false);
        let counters = sampling.counters.clone();
        *state.lock() = MonitorState::Running;

        let task_state = state.clone();
        let task = tokio::spawn(
            async move {
                run_loop(sampling, settings.interval, origin, stop_rx).await;
                let mut state = task_state.lock();
                if *state != MonitorState::Stopping {
                    *state = MonitorState::Stopped;
                }
            }
            .in_current_span(),
        );

        info!(
            "resource monitor running (every {:?}, overload above {:.0}%)",
            settings.interval, settings.overload_threshold
        );

        MonitorHandle {
            state,
            stop_tx,
            task: Some(task),
            join_timeout: settings.join_timeout,
            counters,
        }
    }
}

async fn run_loop<P: ResourceProbe>(
    mut sampling: Sampling<P>,
    interval: Duration,
    origin: Instant,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut ticks = interval_at(origin + interval, interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *stop_rx.borrow() {
            break;
        }

        // A dropped sender counts as a stop request
        tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            _ = ticks.tick() => {}
        }

        tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            _ = sampling.sample_and_record(None) => {}
        }
    }

    debug!("resource monitor loop exited");
}

/// Running monitor; dropping it requests a stop without waiting
pub struct MonitorHandle {
    state: Arc<Mutex<MonitorState>>,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    join_timeout: Duration,
    counters: Arc<Counters>,
}

impl MonitorHandle {
    pub fn state(&self) -> MonitorState {
        *self.state.lock()
    }

    pub fn samples_recorded(&self) -> u64 {
        self.counters.recorded.load(Ordering::Relaxed)
    }

    /// Signal cancellation and join within the configured timeout
    pub async fn stop(mut self) -> StopReport {
        *self.state.lock() = MonitorState::Stopping;
        let _ = self.stop_tx.send(true);

        let joined = match self.task.take() {
            Some(mut task) => match tokio::time::timeout(self.join_timeout, &mut task).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    error!("resource monitor task failed: {}", e);
                    false
                }
                Err(_) => {
                    warn!(
                        "resource monitor did not stop within {:?}, aborting it",
                        self.join_timeout
                    );
                    task.abort();
                    false
                }
            },
            None => true,
        };

        *self.state.lock() = MonitorState::Stopped;

        let report = StopReport {
            joined,
            samples_recorded: self.counters.recorded.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        };
        info!(
            "resource monitor stopped ({} samples, {} failures)",
            report.samples_recorded, report.failures
        );
        report
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SampleError;
    use std::collections::VecDeque;

    /// Takes `window` per sample and replays canned results
    struct CannedProbe {
        window: Duration,
        script: VecDeque<Result<ResourceReading, SampleError>>,
        fallback: ResourceReading,
    }

    impl CannedProbe {
        fn steady(window: Duration, cpu_percent: f64) -> Self {
            Self {
                window,
                script: VecDeque::new(),
                fallback: ResourceReading { cpu_percent, memory_percent: 20.0 },
            }
        }
    }

    impl ResourceProbe for CannedProbe {
        async fn sample(&mut self) -> Result<ResourceReading, SampleError> {
            tokio::time::sleep(self.window).await;
            self.script.pop_front().unwrap_or(Ok(self.fallback))
        }
    }

    fn settings(interval_secs: u64) -> MonitorSettings {
        MonitorSettings {
            interval: Duration::from_secs(interval_secs),
            overload_threshold: 80.0,
            join_timeout: Duration::from_secs(10),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_twelve_seconds_at_five_second_interval_gives_three_samples() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TimeSeriesStore::new(dir.path().join("server_resources.json")));
        let probe = CannedProbe::steady(Duration::from_secs(1), 10.0);

        let monitor = ResourceMonitor::new(probe, store.clone(), ElapsedClock::starting_at_zero(), settings(5));
        assert_eq!(monitor.state(), MonitorState::Idle);

        let started = Instant::now();
        let handle = monitor.start().await;
        assert_eq!(handle.state(), MonitorState::Running);

        tokio::time::sleep_until(started + Duration::from_secs(12)).await;

        let stop_started = Instant::now();
        let report = handle.stop().await;
        assert!(stop_started.elapsed() <= Duration::from_secs(6));

        assert!(report.joined);
        assert_eq!(report.samples_recorded, 3);
        assert_eq!(report.failures, 0);

        let timestamps: Vec<u64> = store.load().unwrap().iter().map(|s| s.timestamp).collect();
        assert_eq!(timestamps, vec![0, 6, 11]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_a_long_sampling_window() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TimeSeriesStore::new(dir.path().join("client_resources.json")));
        let probe = CannedProbe::steady(Duration::from_secs(3), 10.0);

        let handle = ResourceMonitor::new(probe, store, ElapsedClock::starting_at_zero(), settings(1))
            .start()
            .await;

        // Baseline done at 3s, first tick at 1s already due, now mid-window
        tokio::time::sleep(Duration::from_secs(1)).await;

        let stop_started = Instant::now();
        let report = handle.stop().await;
        assert!(report.joined);
        assert!(stop_started.elapsed() < Duration::from_secs(1));
        assert_eq!(report.samples_recorded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_counted_and_loop_continues() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TimeSeriesStore::new(dir.path().join("server_resources.json")));
        let mut probe = CannedProbe::steady(Duration::from_millis(100), 95.0);
        probe.script.push_back(Ok(ResourceReading { cpu_percent: 5.0, memory_percent: 5.0 }));
        probe.script.push_back(Err(SampleError::Unavailable("probe offline".into())));

        let handle = ResourceMonitor::new(probe, store.clone(), ElapsedClock::starting_at_zero(), settings(1))
            .start()
            .await;
        tokio::time::sleep(Duration::from_millis(2500)).await;
        let report = handle.stop().await;

        assert_eq!(report.failures, 1);
        assert_eq!(report.samples_recorded, 2);

        let records: Vec<ResourceSample> = store.load().unwrap();
        assert!(!records[0].overload);
        assert!(records[1].overload);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_the_handle_stops_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TimeSeriesStore::new(dir.path().join("server_resources.json")));
        let probe = CannedProbe::steady(Duration::from_millis(10), 10.0);

        let handle = ResourceMonitor::new(probe, store.clone(), ElapsedClock::starting_at_zero(), settings(1))
            .start()
            .await;
        let state = handle.state.clone();
        drop(handle);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(*state.lock(), MonitorState::Stopped);
        assert_eq!(store.load().unwrap().len(), 1);
    }
}
