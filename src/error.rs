//! Crate-wide error taxonomy.
//!
//! Configuration errors and startup errors are returned synchronously to
//! the caller. Runtime event-capture errors are swallowed into the event
//! store's own Log rows. Shutdown anomalies are logged except for the
//! final Event Store close error, which is returned from `stop`.

use std::path::PathBuf;

use crate::event_store::EventStoreError;

pub type Result<T> = std::result::Result<T, SubstrateError>;

/// Top-level error returned from public `Supervisor` operations.
#[derive(Debug, thiserror::Error)]
pub enum SubstrateError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),
    #[error(transparent)]
    Startup(#[from] StartupError),
    #[error(transparent)]
    EventStore(#[from] EventStoreError),
    #[error("shutdown error: {0}")]
    Shutdown(#[source] std::io::Error),
}

/// Errors surfaced synchronously from `add_working_directory` / config
/// validation, before any process is started.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("entity name must not be blank")]
    BlankName,
    #[error("duplicate name: {0}")]
    DuplicateName(String),
    #[error("invalid port: {0} (must be in 1..=65535)")]
    InvalidPort(i64),
    #[error("{path} is not a directory")]
    NotADirectory { path: PathBuf },
    #[error("could not resolve {relative} in the current directory or any parent")]
    WorkingDirectoryNotFound { relative: String },
}

/// Errors surfaced synchronously from `Supervisor::start`.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("failed to write compose manifest: {0}")]
    ComposeManifest(#[source] std::io::Error),
    #[error("failed to launch process '{name}': {source}")]
    ProcessLaunch {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("readiness timeout for '{name}': {reason}")]
    ReadinessTimeout { name: String, reason: String },
    #[error("container engine error: {0}")]
    ContainerEngine(#[from] bollard::errors::Error),
    #[error("proxy bind error: {0}")]
    ProxyBind(#[source] std::io::Error),
}
