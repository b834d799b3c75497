/*!
Test harness for telemetry roles

- Isolated temp directory holding stores, sentinel and logs
- Fast config (few points, short runs, small backoff)
- Scripted resource probe with canned readings
- Readers for what a run left on disk
*/

use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use telemetry_core::error::SampleError;
use telemetry_core::sampler::{ResourceProbe, ResourceReading};
use telemetry_core::store::{ResourceSample, TimeSeriesStore};
use telemetry_core::{Role, StartTimeHandshake, TelemetryConfig};

/// Probe replaying a script, then a steady reading
pub struct ScriptedProbe {
    window: Duration,
    script: VecDeque<Result<ResourceReading, SampleError>>,
    steady: ResourceReading,
    calls: Arc<AtomicUsize>,
}

impl ScriptedProbe {
    pub fn steady(cpu_percent: f64, memory_percent: f64) -> Self {
        Self {
            window: Duration::from_millis(10),
            script: VecDeque::new(),
            steady: ResourceReading { cpu_percent, memory_percent },
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn then_reading(mut self, cpu_percent: f64, memory_percent: f64) -> Self {
        self.script.push_back(Ok(ResourceReading { cpu_percent, memory_percent }));
        self
    }

    pub fn then_failure(mut self, reason: &str) -> Self {
        self.script.push_back(Err(SampleError::Unavailable(reason.to_string())));
        self
    }

    /// Shared counter of `sample()` calls, usable after the probe is moved
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl ResourceProbe for ScriptedProbe {
    async fn sample(&mut self) -> Result<ResourceReading, SampleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.window).await;
        self.script.pop_front().unwrap_or(Ok(self.steady))
    }
}

/// Temp workspace plus a config pointing into it
pub struct TestHarness {
    dir: TempDir,
    pub config: TelemetryConfig,
}

impl TestHarness {
    pub fn new() -> Result<Self> {
        tracing_subscriber::fmt().with_test_writer().try_init().ok();

        let dir = tempfile::tempdir().context("Failed to create test directory")?;
        let mut config = TelemetryConfig::default();

        config.storage.data_dir = dir.path().to_path_buf();
        config.storage.log_dir = dir.path().join("logs");
        config.storage.handshake_max_wait_secs = 1;
        config.storage.retry_backoff_ms = 10;

        config.endpoint.connect_wait_secs = 1;
        config.points.count = 5;

        config.producer.cadence_secs = 0.2;
        config.producer.passes = 3;

        config.consumer.run_duration_secs = 1;

        config.monitor.sampling_interval_secs = 1;
        config.monitor.sampling_window_ms = 10;
        config.monitor.join_timeout_secs = 2;

        Ok(Self { dir, config })
    }

    pub fn data_dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn handshake(&self) -> StartTimeHandshake {
        StartTimeHandshake::new(self.config.handshake_path())
    }

    pub fn store(&self, role: Role) -> TimeSeriesStore {
        TimeSeriesStore::new(self.config.store_path(role))
    }

    /// Parsed records of a role's store
    pub fn records(&self, role: Role) -> Result<Vec<ResourceSample>> {
        Ok(self.store(role).load()?)
    }

    /// Raw JSON of a role's store, as an external reader would see it
    pub fn raw_store(&self, role: Role) -> Result<Value> {
        let path = self.config.store_path(role);
        let content = std::fs::read_to_string(&path).with_context(|| format!("Failed to read {:?}", path))?;
        Ok(serde_json::from_str(&content)?)
    }
}
