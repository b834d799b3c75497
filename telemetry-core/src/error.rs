/**
 * ERRORS - Error taxonomy shared by both telemetry roles
 *
 * ROLE :
 * Every failure carries an `ErrorKind` so callers branch on what the failure
 * means for the run (retry next cycle, abort startup, abort steady state,
 * continue degraded) instead of catching everything uniformly.
 */

use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// What a failure means for the current run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Logged, retried on the next natural cycle, process continues
    Transient,
    /// Collaborator never became ready: abort before steady state
    StartupFatal,
    /// Current run loop aborts, teardown still runs
    SteadyStateFatal,
    /// Run continues with reduced accuracy
    Degraded,
}

/// Time-series store failures
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{path:?} still locked after {attempts} rename attempts")]
    Contention {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Io { path: path.into(), source }
    }

    pub fn kind(&self) -> ErrorKind {
        ErrorKind::SteadyStateFatal
    }
}

/// Resource probe failures
#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    #[error("resource probe unavailable: {0}")]
    Unavailable(String),
}

impl SampleError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Transient
    }
}

/// Point session (protocol collaborator) failures
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("point session is not running")]
    NotRunning,
    #[error("point session failed to start")]
    StartFailed(#[source] Box<ProtocolError>),
    #[error("point session not connected after {0:?}")]
    NotConnected(Duration),
    #[error("point {0} is not registered on this station")]
    UnknownPoint(u32),
    #[error("transport error: {0}")]
    Transport(#[from] rumqttc::ClientError),
    #[error("payload encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("session failure: {0}")]
    Session(String),
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::NotRunning | ProtocolError::StartFailed(_) | ProtocolError::NotConnected(_) => {
                ErrorKind::StartupFatal
            }
            _ => ErrorKind::SteadyStateFatal,
        }
    }
}

/// Start-time sentinel failures
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("IO error on sentinel {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid sentinel content: {0}")]
    Parse(#[from] serde_json::Error),
}

impl HandshakeError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Degraded
    }
}

/// Configuration loading failures
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Umbrella error returned by lifecycle and role runners
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Sample(#[from] SampleError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl TelemetryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TelemetryError::Store(e) => e.kind(),
            TelemetryError::Sample(e) => e.kind(),
            TelemetryError::Protocol(e) => e.kind(),
            TelemetryError::Handshake(e) => e.kind(),
            TelemetryError::Config(_) => ErrorKind::StartupFatal,
        }
    }
}

/// Renders an error and every `source()` below it on one line
pub fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut current = error.source();
    while let Some(cause) = current {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        current = cause.source();
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_kinds() {
        assert_eq!(ProtocolError::NotRunning.kind(), ErrorKind::StartupFatal);
        assert_eq!(
            ProtocolError::NotConnected(Duration::from_secs(10)).kind(),
            ErrorKind::StartupFatal
        );
        assert_eq!(ProtocolError::UnknownPoint(7).kind(), ErrorKind::SteadyStateFatal);
        assert_eq!(
            ProtocolError::StartFailed(Box::new(ProtocolError::Session("refused".into()))).kind(),
            ErrorKind::StartupFatal
        );
        assert_eq!(
            TelemetryError::from(SampleError::Unavailable("no cpu".into())).kind(),
            ErrorKind::Transient
        );
    }

    #[test]
    fn test_error_chain_includes_sources() {
        let err = StoreError::Contention {
            path: PathBuf::from("server_resources.json"),
            attempts: 3,
            source: io::Error::new(io::ErrorKind::PermissionDenied, "sharing violation"),
        };
        let chain = error_chain(&err);
        assert!(chain.contains("3 rename attempts"));
        assert!(chain.ends_with("sharing violation"));
    }
}
