/**
 * TIME-SERIES STORE - Durable load history for one telemetry role
 *
 * ROLE :
 * Keeps every (timestamp, cpu%, mem%, overload) sample of a role in a single
 * JSON array on disk, one record per timestamp.
 *
 * OPERATION :
 * - append = reload the array, drop any record with the same timestamp,
 *   push the new one, write the whole array back
 * - writes go to a temp sibling, are fsynced, then renamed over the target,
 *   so readers only ever see a complete array
 * - a failed rename (target locked by a reader) is retried with backoff
 * - an unparseable file is treated as empty and replaced on the next write
 *
 * FILE EXAMPLE :
 * ```json
 * [
 *   { "timestamp": 0, "cpu_percent": 12.5, "memory_percent": 41.0, "overload": false },
 *   { "timestamp": 5, "cpu_percent": 85.1, "memory_percent": 41.2, "overload": true }
 * ]
 * ```
 */

use crate::error::StoreError;
use crate::sampler::ResourceReading;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Target of the human-readable resource log stream
pub const RESOURCE_LOG_TARGET: &str = "resource_usage";

/// One persisted load observation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    /// Whole seconds elapsed since the shared t0
    pub timestamp: u64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub overload: bool,
}

impl ResourceSample {
    pub fn new(timestamp: u64, reading: ResourceReading, overload_threshold: f64) -> Self {
        Self {
            timestamp,
            cpu_percent: reading.cpu_percent,
            memory_percent: reading.memory_percent,
            overload: reading.exceeds(overload_threshold),
        }
    }
}

/// How often and how patiently a blocked rename is retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Append-only JSON array store with timestamp dedup
pub struct TimeSeriesStore {
    path: PathBuf,
    retry: RetryPolicy,
    /// Serialises read-modify-write cycles through this store value
    write_lock: Mutex<()>,
}

impl TimeSeriesStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            retry: RetryPolicy::default(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = RetryPolicy {
            attempts: retry.attempts.max(1),
            backoff: retry.backoff,
        };
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whole-file reload; absent or corrupt files read as empty
    pub fn load(&self) -> Result<Vec<ResourceSample>, StoreError> {
        let content = match fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };

        match serde_json::from_slice::<Vec<ResourceSample>>(&content) {
            Ok(records) => Ok(records),
            Err(e) => {
                warn!("discarding unreadable store {:?}: {}", self.path, e);
                Ok(Vec::new())
            }
        }
    }

    /// Insert or replace the record for `sample.timestamp`
    pub fn append(&self, sample: ResourceSample) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();

        let mut records = self.load()?;
        let before = records.len();
        records.retain(|record| record.timestamp != sample.timestamp);
        if records.len() != before {
            debug!("replacing record at t={}s in {:?}", sample.timestamp, self.path);
        }
        records.push(sample);

        let json = serde_json::to_vec_pretty(&records)?;
        self.write_atomic(&json)?;

        info!(
            target: RESOURCE_LOG_TARGET,
            "t={}s cpu={:.1}% mem={:.1}% overload={}",
            sample.timestamp,
            sample.cpu_percent,
            sample.memory_percent,
            sample.overload
        );
        Ok(())
    }

    /// Temp sibling + fsync + rename, with the rename retried under contention
    fn write_atomic(&self, data: &[u8]) -> Result<(), StoreError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;

        let mut temp = tempfile::Builder::new()
            .prefix(".resources-")
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(|e| StoreError::io(dir, e))?;
        temp.write_all(data).map_err(|e| StoreError::io(temp.path(), e))?;
        temp.as_file().sync_all().map_err(|e| StoreError::io(temp.path(), e))?;

        let mut attempt = 1;
        loop {
            match temp.persist(&self.path) {
                Ok(_) => return Ok(()),
                Err(e) if attempt >= self.retry.attempts => {
                    // Dropping the returned temp file removes it
                    return Err(StoreError::Contention {
                        path: self.path.clone(),
                        attempts: attempt,
                        source: e.error,
                    });
                }
                Err(e) => {
                    warn!(
                        "rename onto {:?} failed (attempt {}/{}): {}",
                        self.path, attempt, self.retry.attempts, e.error
                    );
                    temp = e.file;
                    std::thread::sleep(self.retry.backoff);
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn sample(timestamp: u64, cpu: f64) -> ResourceSample {
        ResourceSample::new(timestamp, ResourceReading { cpu_percent: cpu, memory_percent: 30.0 }, 80.0)
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = TimeSeriesStore::new(dir.path().join("server_resources.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_last_write_wins_per_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let store = TimeSeriesStore::new(dir.path().join("server_resources.json"));

        store.append(sample(0, 10.0)).unwrap();
        store.append(sample(5, 20.0)).unwrap();
        store.append(sample(0, 30.0)).unwrap();
        store.append(sample(10, 40.0)).unwrap();
        store.append(sample(5, 50.0)).unwrap();

        let records = store.load().unwrap();
        assert_eq!(records.len(), 3);

        let cpu_at = |ts: u64| records.iter().find(|r| r.timestamp == ts).map(|r| r.cpu_percent);
        assert_eq!(cpu_at(0), Some(30.0));
        assert_eq!(cpu_at(5), Some(50.0));
        assert_eq!(cpu_at(10), Some(40.0));
    }

    #[test]
    fn test_overload_flag_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = TimeSeriesStore::new(dir.path().join("client_resources.json"));

        store
            .append(ResourceSample::new(1, ResourceReading { cpu_percent: 81.0, memory_percent: 10.0 }, 80.0))
            .unwrap();
        store
            .append(ResourceSample::new(2, ResourceReading { cpu_percent: 80.0, memory_percent: 10.0 }, 80.0))
            .unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw[0]["overload"], serde_json::Value::Bool(true));
        assert_eq!(raw[1]["overload"], serde_json::Value::Bool(false));
        assert_eq!(raw[0]["timestamp"], 1);
    }

    #[test]
    fn test_corrupt_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server_resources.json");
        fs::write(&path, "[{\"timestamp\": 0, \"cpu_perc").unwrap();

        let store = TimeSeriesStore::new(&path);
        assert!(store.load().unwrap().is_empty());

        store.append(sample(3, 15.0)).unwrap();
        assert_eq!(store.load().unwrap(), vec![sample(3, 15.0)]);
    }

    #[test]
    fn test_non_utf8_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server_resources.json");
        fs::write(&path, [0xff, 0xfe, b'[', 0x80]).unwrap();

        let store = TimeSeriesStore::new(&path);
        assert!(store.load().unwrap().is_empty());

        store.append(sample(7, 12.0)).unwrap();
        assert_eq!(store.load().unwrap(), vec![sample(7, 12.0)]);
    }

    #[test]
    fn test_leftover_temp_file_is_invisible_to_readers() {
        let dir = tempfile::tempdir().unwrap();
        let store = TimeSeriesStore::new(dir.path().join("server_resources.json"));
        store.append(sample(0, 10.0)).unwrap();

        // Crash between temp write and rename
        fs::write(dir.path().join(".resources-crash.tmp"), "[{\"timestamp\": 9").unwrap();

        assert_eq!(store.load().unwrap(), vec![sample(0, 10.0)]);
        store.append(sample(5, 11.0)).unwrap();
        assert_eq!(store.load().unwrap().len(), 2);
    }

    #[test]
    fn test_no_temp_files_left_after_append() {
        let dir = tempfile::tempdir().unwrap();
        let store = TimeSeriesStore::new(dir.path().join("server_resources.json"));
        for ts in 0..5 {
            store.append(sample(ts, 1.0)).unwrap();
        }

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_shared_store_keeps_every_concurrent_append() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TimeSeriesStore::new(dir.path().join("server_resources.json")));

        let writers: Vec<_> = (0..4u64)
            .map(|writer| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..10u64 {
                        store.append(sample(writer * 100 + i, i as f64)).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        assert_eq!(store.load().unwrap().len(), 40);
    }

    #[test]
    fn test_independent_writers_never_corrupt_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server_resources.json");

        let writers: Vec<_> = (0..4u64)
            .map(|writer| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let store = TimeSeriesStore::new(path);
                    for i in 0..10u64 {
                        store.append(sample(writer * 100 + i, i as f64)).unwrap();
                    }
                })
            })
            .collect();

        // Reader polling while writers run
        for _ in 0..50 {
            if let Ok(content) = fs::read_to_string(&path) {
                assert!(serde_json::from_str::<Vec<ResourceSample>>(&content).is_ok());
            }
        }
        for writer in writers {
            writer.join().unwrap();
        }

        let content = fs::read_to_string(&path).unwrap();
        let records: Vec<ResourceSample> = serde_json::from_str(&content).unwrap();
        assert!(!records.is_empty());
    }

    #[test]
    fn test_blocked_rename_exhausts_retry_bound() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("server_resources.json");
        // A non-empty directory cannot be replaced by a file rename
        fs::create_dir(&target).unwrap();
        fs::write(target.join("held"), "x").unwrap();

        let store = TimeSeriesStore::new(&target).with_retry_policy(RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(10),
        });

        match store.write_atomic(b"[]") {
            Err(StoreError::Contention { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected contention error, got {:?}", other),
        }

        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
