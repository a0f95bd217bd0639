//! Home Assistant websocket ingestion.
//!
//! One kameo actor owns the upstream connection: it authenticates, subscribes, reconnects
//! with exponential backoff and normalizes `state_changed` events. A forwarding task posts
//! the normalized events downstream, and `/health` reports the state of the whole pipeline.

pub mod config;
pub mod core;
pub mod forward;
pub mod protocol;
pub mod server;
pub mod testing;
pub mod tls;
pub mod transport;
pub mod ws;

pub use config::IngestConfig;
pub use core::{ConnectionState, HealthSnapshot, HealthStatus, IngestError, IngestResult};
pub use ws::{GetConnectionState, GetHealthSnapshot, IngestActor, IngestActorArgs, Start, Stop};
