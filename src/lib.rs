#![forbid(unsafe_code)]

//! Offline peer-to-peer replication and admission for a small fleet of
//! co-located scan gates.
//!
//! Each device admits or rejects credential-code scans against its local
//! replica and converges with its peers over link-local UDP gossip: delta
//! dissemination with ACK/retry, heartbeats, cheap state-hash
//! reconciliation, and full-state repair. No central server; devices keep
//! admitting while offline and heal when the network returns.

#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod net;
mod paths;
pub mod store;
pub mod telemetry;
pub mod testkit;

pub use error::{Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the surface the embedding shell works with.
pub use crate::config::Config;
pub use crate::core::{
    CodeSnapshot, DayKey, DeviceId, IdSource, MessageId, PassEntry, PassSnapshot, PassType,
    PeerPhase, PeerRecord, ReplicaView, ScanEvent, ScanId, SystemClock, UuidIds, WallClockSource,
};
pub use crate::engine::{DenyReason, Engine, EngineError, Health, ScanOutcome};
