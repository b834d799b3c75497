//! Host load sampling
//!
//! Provides the CPU/memory observation the resource monitor records:
//! - CPU usage over a fixed observation window
//! - Memory usage as used/total
//! - Overload classification against a threshold

use crate::error::SampleError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use sysinfo::System;
use tracing::debug;

/// Default CPU observation window
pub const DEFAULT_SAMPLING_WINDOW: Duration = Duration::from_secs(1);

/// Default overload threshold in percent
pub const DEFAULT_OVERLOAD_THRESHOLD: f64 = 80.0;

/// One CPU/memory observation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceReading {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

impl ResourceReading {
    /// Strictly greater-than on either resource
    pub fn exceeds(&self, threshold: f64) -> bool {
        self.cpu_percent > threshold || self.memory_percent > threshold
    }
}

/// Something that can observe CPU and memory load
pub trait ResourceProbe: Send {
    /// Blocks the calling task for the probe's observation window
    fn sample(&mut self) -> impl Future<Output = Result<ResourceReading, SampleError>> + Send;
}

/// Host-wide probe backed by `sysinfo`
pub struct SystemProbe {
    sys: System,
    window: Duration,
}

impl SystemProbe {
    pub fn new(window: Duration) -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        Self {
            sys,
            // sysinfo needs at least this long between refreshes for a real CPU figure
            window: window.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLING_WINDOW)
    }
}

impl ResourceProbe for SystemProbe {
    async fn sample(&mut self) -> Result<ResourceReading, SampleError> {
        self.sys.refresh_cpu_usage();
        tokio::time::sleep(self.window).await;
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();

        if self.sys.cpus().is_empty() {
            return Err(SampleError::Unavailable("no CPU reported by the OS".into()));
        }

        let total = self.sys.total_memory();
        if total == 0 {
            return Err(SampleError::Unavailable("total memory reported as zero".into()));
        }

        let cpu_percent = f64::from(self.sys.global_cpu_info().cpu_usage()).clamp(0.0, 100.0);
        let memory_percent = (self.sys.used_memory() as f64 / total as f64 * 100.0).clamp(0.0, 100.0);

        debug!("sampled cpu={:.1}% mem={:.1}%", cpu_percent, memory_percent);
        Ok(ResourceReading { cpu_percent, memory_percent })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overload_is_strictly_greater() {
        let reading = ResourceReading { cpu_percent: 81.0, memory_percent: 10.0 };
        assert!(reading.exceeds(80.0));

        let reading = ResourceReading { cpu_percent: 80.0, memory_percent: 10.0 };
        assert!(!reading.exceeds(80.0));

        let reading = ResourceReading { cpu_percent: 5.0, memory_percent: 80.5 };
        assert!(reading.exceeds(80.0));
    }

    #[test]
    fn test_window_never_below_os_minimum() {
        let probe = SystemProbe::new(Duration::ZERO);
        assert!(probe.window() >= sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    }

    #[tokio::test]
    async fn test_system_probe_reports_percentages() {
        let mut probe = SystemProbe::new(Duration::from_millis(250));
        let reading = probe.sample().await.unwrap();
        assert!((0.0..=100.0).contains(&reading.cpu_percent));
        assert!(reading.memory_percent > 0.0 && reading.memory_percent <= 100.0);
    }
}
