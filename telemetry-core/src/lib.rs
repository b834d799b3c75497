//! Telemetry Core - shared engine of the producer/consumer pair
//!
//! Provides:
//! - Point session abstraction and its MQTT adapter
//! - Paced emission (producer) and point ingest (consumer)
//! - Background CPU/memory monitor with a crash-safe JSON time series
//! - Start-time handshake so both roles share one elapsed-time axis
//! - Config, error taxonomy and logging setup used by both binaries

pub mod config;
pub mod emission;
pub mod error;
pub mod handshake;
pub mod ingest;
pub mod lifecycle;
pub mod logging;
pub mod monitor;
pub mod protocol;
pub mod roles;
pub mod sampler;
pub mod store;

pub use config::{ConfigSource, Role, TelemetryConfig};
pub use error::{error_chain, ErrorKind, TelemetryError};
pub use handshake::{ElapsedClock, StartTimeHandshake, T0Source, TimeBase};
pub use lifecycle::{Lifecycle, PassiveWait, RoleLoop, RunOutcome, RunSummary};
pub use monitor::{MonitorHandle, MonitorSettings, ResourceMonitor, StopReport};
pub use protocol::{AckResult, Cause, Point, PointSession, PointType, PointUpdate};
pub use roles::{run_consumer, run_producer, IngestReport};
pub use sampler::{ResourceProbe, ResourceReading, SystemProbe};
pub use store::{ResourceSample, TimeSeriesStore};
