//! Peer record: what one device knows about another.
//!
//! Records are created on first inbound datagram from an unknown device,
//! mutated on every inbound, and persisted across restarts.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use super::identity::DeviceId;

/// Connection phase of a remote peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeerPhase {
    /// Known identity, nothing heard yet (e.g. loaded from the store).
    Discovering,
    /// Heard from recently.
    Connected,
    /// State hash matched ours on last comparison.
    Synced,
    /// Liveness window expired; kept for resumption.
    Lost,
}

impl PeerPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            PeerPhase::Discovering => "discovering",
            PeerPhase::Connected => "connected",
            PeerPhase::Synced => "synced",
            PeerPhase::Lost => "lost",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "discovering" => Some(PeerPhase::Discovering),
            "connected" => Some(PeerPhase::Connected),
            "synced" => Some(PeerPhase::Synced),
            "lost" => Some(PeerPhase::Lost),
            _ => None,
        }
    }
}

impl fmt::Display for PeerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Everything tracked per remote device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerRecord {
    pub device_id: DeviceId,
    pub ip: Option<IpAddr>,
    pub last_seen_ms: u64,
    pub last_heartbeat_ms: u64,
    pub state_hash: Option<String>,
    pub phase: PeerPhase,
}

impl PeerRecord {
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            ip: None,
            last_seen_ms: 0,
            last_heartbeat_ms: 0,
            state_hash: None,
            phase: PeerPhase::Discovering,
        }
    }

    /// Liveness: counted as connected iff heard from within the window.
    pub fn is_live(&self, now_ms: u64, window_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_seen_ms) < window_ms
    }
}
