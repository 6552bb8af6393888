//! A developer-local orchestrator that launches services and managed
//! infrastructure dependencies, captures their traffic (stdout/stderr
//! logs, HTTP request/response pairs, Kafka topic messages) into a
//! single append-only event store, and streams that traffic in real
//! time to WebSocket observers.
//!
//! This crate is the Supervisor core: parsing a configuration language
//! into the tree [`config::ConfigTree`] describes, the top-level
//! command-line entry point, and config-file discovery are all out of
//! scope and left to a downstream binary. A minimal downstream binary
//! only needs to:
//!
//! 1. Open an [`event_store::EventStore`].
//! 2. Build a [`supervisor::Supervisor`] around it and call
//!    [`supervisor::Supervisor::start`] with a [`config::ConfigTree`].
//! 3. Mount [`broadcast::websocket_route`] on an `axum::Router` and serve it
//!    alongside a [`broadcast::BroadcastTailer`] spawned against the same store.
//! 4. Call [`supervisor::Supervisor::stop`] on shutdown.

pub mod broadcast;
pub mod config;
pub mod error;
pub mod event_store;
pub mod janitor;
pub mod kafka_observer;
pub mod line_splitter;
pub mod process;
pub mod proxy;
pub mod readiness;
mod settings;
pub mod supervisor;

pub use config::{ConfigEntity, ConfigTree, ManagedDependency, ManagedDependencyKind, Service};
pub use error::{ConfigError, StartupError, SubstrateError};
pub use event_store::EventStore;
pub use supervisor::Supervisor;
