//! Peer table: everything the engine knows about the rest of the fleet.
//!
//! Records survive liveness loss (enabling resumption) but lapsed peers are
//! excluded from peer counts and heartbeat targets.

use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::core::{DeviceId, PeerPhase, PeerRecord};

/// Outcome of recording an inbound datagram against the table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Observation {
    /// First time this device id has ever been seen (not in the table).
    pub newly_known: bool,
    /// Phase transition, if any, for logging.
    pub phase_change: Option<(PeerPhase, PeerPhase)>,
}

#[derive(Debug, Default)]
pub struct PeerTable {
    peers: BTreeMap<DeviceId, PeerRecord>,
    liveness_ms: u64,
}

impl PeerTable {
    pub fn new(liveness_ms: u64) -> Self {
        Self {
            peers: BTreeMap::new(),
            liveness_ms,
        }
    }

    /// Adopt records persisted by a previous run. They start in `lost`:
    /// addressable for unicast but not counted until they speak.
    pub fn seed(&mut self, records: Vec<PeerRecord>) {
        for mut record in records {
            record.phase = PeerPhase::Lost;
            self.peers.insert(record.device_id, record);
        }
    }

    /// Record an inbound datagram from `device_id`. Updates address,
    /// last-seen, heartbeat stamp and reported hash, and moves lapsed or
    /// new peers to `connected`.
    pub fn observe(
        &mut self,
        device_id: DeviceId,
        ip: IpAddr,
        now_ms: u64,
        heartbeat: bool,
        state_hash: Option<&str>,
    ) -> Observation {
        let newly_known = !self.peers.contains_key(&device_id);
        let record = self
            .peers
            .entry(device_id)
            .or_insert_with(|| PeerRecord::new(device_id));
        let before = record.phase;

        record.ip = Some(ip);
        record.last_seen_ms = now_ms;
        if heartbeat {
            record.last_heartbeat_ms = now_ms;
        }
        if let Some(hash) = state_hash {
            record.state_hash = Some(hash.to_string());
        }
        if matches!(record.phase, PeerPhase::Discovering | PeerPhase::Lost) {
            record.phase = PeerPhase::Connected;
        }

        Observation {
            newly_known,
            phase_change: (before != record.phase).then_some((before, record.phase)),
        }
    }

    /// State hash agreed: the peer holds the same event set we do.
    pub fn mark_synced(&mut self, device_id: &DeviceId) {
        if let Some(record) = self.peers.get_mut(device_id) {
            record.phase = PeerPhase::Synced;
        }
    }

    /// State hash diverged: back to connected until reconciled.
    pub fn mark_unsynced(&mut self, device_id: &DeviceId) {
        if let Some(record) = self.peers.get_mut(device_id)
            && record.phase == PeerPhase::Synced
        {
            record.phase = PeerPhase::Connected;
        }
    }

    /// Move peers past the liveness window to `lost`. Returns the peers
    /// that lapsed on this sweep.
    pub fn sweep(&mut self, now_ms: u64) -> Vec<DeviceId> {
        let mut lapsed = Vec::new();
        for record in self.peers.values_mut() {
            if record.phase != PeerPhase::Lost && !record.is_live(now_ms, self.liveness_ms) {
                record.phase = PeerPhase::Lost;
                lapsed.push(record.device_id);
            }
        }
        lapsed
    }

    pub fn connected_count(&self, now_ms: u64) -> usize {
        self.peers
            .values()
            .filter(|r| r.is_live(now_ms, self.liveness_ms))
            .count()
    }

    /// Live peers with a usable address: heartbeat targets.
    pub fn live_addressed(&self, now_ms: u64) -> Vec<(DeviceId, IpAddr)> {
        self.peers
            .values()
            .filter(|r| r.is_live(now_ms, self.liveness_ms))
            .filter_map(|r| r.ip.map(|ip| (r.device_id, ip)))
            .collect()
    }

    /// Every known peer with a usable address, live or lapsed.
    pub fn addressed(&self) -> Vec<(DeviceId, IpAddr)> {
        self.peers
            .values()
            .filter_map(|r| r.ip.map(|ip| (r.device_id, ip)))
            .collect()
    }

    pub fn get(&self, device_id: &DeviceId) -> Option<&PeerRecord> {
        self.peers.get(device_id)
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn records(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }
}
