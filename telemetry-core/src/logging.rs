//! Tracing setup shared by both binaries
//!
//! Two layers on one registry:
//! - console, filtered by `RUST_LOG` (default `info`)
//! - the role's resource log file, fed only by `resource_usage` events and
//!   truncated when the process starts

use crate::store::RESOURCE_LOG_TARGET;
use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::filter::{EnvFilter, Targets};
use tracing_subscriber::prelude::*;

pub fn init_logging(resource_log: &Path) -> io::Result<()> {
    if let Some(dir) = resource_log.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let file = File::create(resource_log)?;

    let console = tracing_subscriber::fmt::layer()
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));

    let resource_file = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(Mutex::new(file))
        .with_filter(Targets::new().with_target(RESOURCE_LOG_TARGET, Level::INFO));

    tracing_subscriber::registry()
        .with(console)
        .with(resource_file)
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}
