//! Start-time handshake between the two roles
//!
//! The consumer starts first and publishes its wall-clock start (t0) into a
//! sentinel file. The producer polls for it so both resource stores share the
//! same elapsed-time axis. The sentinel is written once and never replaced
//! while a run pair is live.

use crate::config::Role;
use crate::error::HandshakeError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Sentinel file content
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StartTimeRecord {
    /// Epoch seconds
    pub start_time: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PublishOutcome {
    Written,
    /// Someone published first, their value stands
    AlreadyPresent(f64),
}

/// Where a run's t0 came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum T0Source {
    /// This process wrote the sentinel
    Published,
    /// This process wanted to publish but found a value already there
    Existing,
    /// Read from the sentinel written by the peer
    Handshake,
    /// No sentinel in time, local wall clock used
    LocalFallback,
}

/// The agreed time zero of a run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeBase {
    pub t0_epoch: f64,
    pub source: T0Source,
}

impl TimeBase {
    pub fn local_now() -> Self {
        Self {
            t0_epoch: epoch_now(),
            source: T0Source::LocalFallback,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.source == T0Source::LocalFallback
    }

    /// Monotonic clock counting from this t0
    pub fn clock(&self) -> ElapsedClock {
        ElapsedClock {
            offset_secs: epoch_now() - self.t0_epoch,
            origin: Instant::now(),
        }
    }
}

/// Elapsed seconds since t0, immune to wall-clock jumps after creation
#[derive(Debug, Clone, Copy)]
pub struct ElapsedClock {
    offset_secs: f64,
    origin: Instant,
}

impl ElapsedClock {
    pub fn starting_at_zero() -> Self {
        Self {
            offset_secs: 0.0,
            origin: Instant::now(),
        }
    }

    /// Whole seconds since t0, never negative
    pub fn elapsed_secs(&self) -> u64 {
        let total = self.offset_secs + self.origin.elapsed().as_secs_f64();
        total.max(0.0).floor() as u64
    }
}

fn epoch_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Single-value sentinel shared by the producer and the consumer
pub struct StartTimeHandshake {
    path: PathBuf,
    poll_interval: Duration,
}

impl StartTimeHandshake {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `t0` unless a value is already there
    pub fn publish(&self, t0_epoch: f64) -> Result<PublishOutcome, HandshakeError> {
        let io_err = |path: &Path, source: io::Error| HandshakeError::Io {
            path: path.to_path_buf(),
            source,
        };

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

        let json = serde_json::to_vec(&StartTimeRecord { start_time: t0_epoch })?;
        let mut temp = tempfile::Builder::new()
            .prefix(".start-time-")
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(|e| io_err(dir, e))?;
        temp.write_all(&json).map_err(|e| io_err(temp.path(), e))?;
        temp.as_file().sync_all().map_err(|e| io_err(temp.path(), e))?;

        match temp.persist_noclobber(&self.path) {
            Ok(_) => {
                info!("published start time {:.3} to {:?}", t0_epoch, self.path);
                Ok(PublishOutcome::Written)
            }
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => match self.read()? {
                Some(existing) => {
                    info!("start time already published ({:.3}), keeping it", existing);
                    Ok(PublishOutcome::AlreadyPresent(existing))
                }
                None => Err(io_err(&self.path, e.error)),
            },
            Err(e) => Err(io_err(&self.path, e.error)),
        }
    }

    /// Current sentinel value, `None` when absent
    pub fn read(&self) -> Result<Option<f64>, HandshakeError> {
        match fs::read_to_string(&self.path) {
            Ok(content) => {
                let record: StartTimeRecord = serde_json::from_str(&content)?;
                Ok(Some(record.start_time))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(HandshakeError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Poll for the peer's t0, falling back to local time after `max_wait`
    pub async fn await_and_read(&self, max_wait: Duration) -> TimeBase {
        let deadline = Instant::now() + max_wait;

        loop {
            match self.read() {
                Ok(Some(t0_epoch)) => {
                    info!("read start time {:.3} from {:?}", t0_epoch, self.path);
                    return TimeBase {
                        t0_epoch,
                        source: T0Source::Handshake,
                    };
                }
                Ok(None) => debug!("start time not published yet"),
                Err(e) => debug!("start time not readable yet: {}", e),
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }

        warn!(
            "no start time in {:?} after {:?}, using local clock",
            self.path, max_wait
        );
        TimeBase::local_now()
    }

    /// Agree on t0 for `role`: the consumer publishes, the producer waits
    pub async fn establish(&self, role: Role, max_wait: Duration) -> TimeBase {
        if !role.publishes_start_time() {
            return self.await_and_read(max_wait).await;
        }

        let now = epoch_now();
        match self.publish(now) {
            Ok(PublishOutcome::Written) => TimeBase {
                t0_epoch: now,
                source: T0Source::Published,
            },
            Ok(PublishOutcome::AlreadyPresent(existing)) => {
                let age = now - existing;
                if age > max_wait.as_secs_f64() {
                    warn!(
                        "adopting start time published {:.0}s ago from {:?}, it may be left over from an earlier run",
                        age, self.path
                    );
                }
                TimeBase {
                    t0_epoch: existing,
                    source: T0Source::Existing,
                }
            }
            Err(e) => {
                warn!("cannot publish start time, using local clock: {}", e);
                TimeBase {
                    t0_epoch: now,
                    source: T0Source::LocalFallback,
                }
            }
        }
    }

    /// Guard that clears the sentinel when dropped, on every exit path
    pub fn clear_on_drop(&self) -> ClearOnDrop<'_> {
        ClearOnDrop { handshake: self }
    }

    /// Remove the sentinel so the next run pair starts fresh
    pub fn clear(&self) -> Result<(), HandshakeError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("cleared start time sentinel {:?}", self.path);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(HandshakeError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

pub struct ClearOnDrop<'a> {
    handshake: &'a StartTimeHandshake,
}

impl Drop for ClearOnDrop<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.handshake.clear() {
            warn!("could not clear start time sentinel: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    struct WarnCounter(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> Layer<S> for WarnCounter {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() == tracing::Level::WARN {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// Count WARN events on this thread until the guard drops
    fn count_warnings() -> (Arc<AtomicUsize>, tracing::subscriber::DefaultGuard) {
        let count = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(WarnCounter(count.clone()));
        (count, tracing::subscriber::set_default(subscriber))
    }

    #[test]
    fn test_publish_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let handshake = StartTimeHandshake::new(dir.path().join("start_time.json"));

        assert_eq!(handshake.publish(100.5).unwrap(), PublishOutcome::Written);
        assert_eq!(handshake.publish(200.0).unwrap(), PublishOutcome::AlreadyPresent(100.5));
        assert_eq!(handshake.read().unwrap(), Some(100.5));

        let raw = fs::read_to_string(handshake.path()).unwrap();
        assert!(raw.contains("\"start_time\""));
    }

    #[test]
    fn test_clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let handshake = StartTimeHandshake::new(dir.path().join("start_time.json"));
        handshake.publish(1.0).unwrap();

        handshake.clear().unwrap();
        handshake.clear().unwrap();
        assert_eq!(handshake.read().unwrap(), None);
    }

    #[test]
    fn test_clear_on_drop_guard() {
        let dir = tempfile::tempdir().unwrap();
        let handshake = StartTimeHandshake::new(dir.path().join("start_time.json"));
        handshake.publish(1.0).unwrap();

        {
            let _cleanup = handshake.clear_on_drop();
            assert!(handshake.path().exists());
        }
        assert!(!handshake.path().exists());
    }

    #[test]
    fn test_elapsed_clock_from_old_t0() {
        let base = TimeBase {
            t0_epoch: epoch_now() - 42.3,
            source: T0Source::Handshake,
        };
        let secs = base.clock().elapsed_secs();
        assert!((42..=43).contains(&secs));

        let future = TimeBase {
            t0_epoch: epoch_now() + 30.0,
            source: T0Source::Handshake,
        };
        assert_eq!(future.clock().elapsed_secs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_reads_late_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("start_time.json");
        let handshake = StartTimeHandshake::new(&path);

        let writer_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            StartTimeHandshake::new(writer_path).publish(1234.5).unwrap();
        });

        let started = Instant::now();
        let base = handshake.await_and_read(Duration::from_secs(5)).await;

        assert_eq!(base.t0_epoch, 1234.5);
        assert_eq!(base.source, T0Source::Handshake);
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(started.elapsed() <= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_falls_back_after_max_wait() {
        let dir = tempfile::tempdir().unwrap();
        let handshake = StartTimeHandshake::new(dir.path().join("start_time.json"));

        let started = Instant::now();
        let base = handshake.await_and_read(Duration::from_secs(5)).await;
        let waited = started.elapsed();

        assert!(base.is_degraded());
        assert!(waited >= Duration::from_secs(5));
        assert!(waited <= Duration::from_millis(5100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_warns_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let handshake = StartTimeHandshake::new(dir.path().join("start_time.json"));
        let (warnings, _guard) = count_warnings();

        let base = handshake.await_and_read(Duration::from_secs(5)).await;

        assert!(base.is_degraded());
        assert_eq!(warnings.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_adopting_stale_start_time_warns() {
        let dir = tempfile::tempdir().unwrap();
        let handshake = StartTimeHandshake::new(dir.path().join("start_time.json"));
        handshake.publish(epoch_now() - 3600.0).unwrap();
        let (warnings, _guard) = count_warnings();

        let base = handshake.establish(Role::Consumer, Duration::from_secs(10)).await;

        assert_eq!(base.source, T0Source::Existing);
        assert_eq!(warnings.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupt_sentinel_counts_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("start_time.json");
        fs::write(&path, "{\"start_ti").unwrap();

        let base = StartTimeHandshake::new(&path).await_and_read(Duration::from_secs(2)).await;
        assert_eq!(base.source, T0Source::LocalFallback);
    }

    #[tokio::test]
    async fn test_establish_by_role() {
        let dir = tempfile::tempdir().unwrap();
        let handshake = StartTimeHandshake::new(dir.path().join("start_time.json"));

        let consumer = handshake.establish(Role::Consumer, Duration::from_secs(1)).await;
        assert_eq!(consumer.source, T0Source::Published);

        let producer = handshake.establish(Role::Producer, Duration::from_secs(1)).await;
        assert_eq!(producer.source, T0Source::Handshake);
        assert_eq!(producer.t0_epoch, consumer.t0_epoch);

        let (warnings, _guard) = count_warnings();
        let second_consumer = handshake.establish(Role::Consumer, Duration::from_secs(1)).await;
        assert_eq!(warnings.load(Ordering::SeqCst), 0);
        assert_eq!(second_consumer.source, T0Source::Existing);
        assert_eq!(second_consumer.t0_epoch, consumer.t0_epoch);
    }
}
