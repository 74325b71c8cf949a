//! The engine state: one object owning the replica, peer table, pending-ACK
//! table, dedup cache, store and transport.
//!
//! Everything here runs on the state thread; the inbound pipeline, the
//! admission path and the timer actions all mutate through `&mut self`, so
//! a one-use check and its append are atomic with respect to other local
//! scans.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::core::{
    DayKey, DeviceId, IdSource, MessageId, PassBook, PassRule, PassSnapshot, ReplicaState,
    ReplicaView, ScanEvent, WallClockSource,
};
use crate::net::wire::{self, Envelope, Payload, WireError};
use crate::net::{Datagram, PeerTable, Transport};
use crate::store::Store;

use super::admission::{self, ScanOutcome};
use super::scheduler::TimerKind;
use super::Health;

/// Bounded cache of recently seen message ids. Evicts the oldest tenth
/// when full.
#[derive(Debug)]
struct RecentIds {
    cap: usize,
    order: VecDeque<MessageId>,
    seen: HashSet<MessageId>,
}

impl RecentIds {
    fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(16),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Returns false if the id was already present.
    fn insert(&mut self, id: MessageId) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.cap {
            let evict = (self.cap / 10).max(1);
            for _ in 0..evict {
                if let Some(old) = self.order.pop_front() {
                    self.seen.remove(&old);
                }
            }
        }
        true
    }
}

/// One un-ACKed delta send, keyed by `(message_id, peer)`.
#[derive(Debug)]
struct PendingSend {
    payload: Vec<u8>,
    ip: IpAddr,
    sent_at: Instant,
    attempts: u32,
}

pub(crate) struct EngineState {
    device_id: DeviceId,
    clock: Arc<dyn WallClockSource>,
    ids: Arc<dyn IdSource>,
    store: Store,
    replica: ReplicaState,
    passes: PassBook,
    snapshot: PassSnapshot,
    peers: PeerTable,
    pending: HashMap<(MessageId, DeviceId), PendingSend>,
    seen: RecentIds,
    transport: Box<dyn Transport>,
    seq: u64,
    max_datagram: usize,
    ack_timeout: Duration,
    max_attempts: u32,
    retry_batch: usize,
    cooldown_ms: u64,
    last_sync_ms: Option<u64>,
}

impl EngineState {
    pub(crate) fn boot(
        config: &Config,
        mut store: Store,
        transport: Box<dyn Transport>,
        clock: Arc<dyn WallClockSource>,
        ids: Arc<dyn IdSource>,
    ) -> crate::Result<Self> {
        let device_id = store.get_or_create_device_id(ids.as_ref())?;
        let snapshot = load_snapshot(config, &mut store)?;
        let log = store.load_all_scans()?;
        let mut passes = PassBook::rebuild(&snapshot, &log);
        for (code, pass_type) in store.load_pass_types()? {
            passes.learn(&code, pass_type);
        }
        let replica = ReplicaState::seed(&passes, log);
        let mut peers = PeerTable::new(config.gossip.liveness_ms);
        peers.seed(store.load_peers()?);

        tracing::info!(
            %device_id,
            scans = replica.len(),
            passes = passes.len(),
            peers = peers.len(),
            "engine state loaded"
        );

        Ok(Self {
            device_id,
            clock,
            ids,
            store,
            replica,
            passes,
            snapshot,
            peers,
            pending: HashMap::new(),
            seen: RecentIds::new(config.gossip.received_cache_size),
            transport,
            seq: 0,
            max_datagram: config.net.max_datagram_bytes,
            ack_timeout: Duration::from_millis(config.gossip.ack_timeout_ms),
            max_attempts: config.gossip.max_send_attempts,
            retry_batch: config.gossip.retry_batch,
            cooldown_ms: config.admission.cooldown_ms,
            last_sync_ms: None,
        })
    }

    pub(crate) fn device_id(&self) -> DeviceId {
        self.device_id
    }

    // === Inbound pipeline ===

    pub(crate) fn handle_datagram(&mut self, datagram: Datagram) {
        let envelope = match wire::decode(&datagram.bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(from = %datagram.from, "dropping undecodable datagram: {e}");
                return;
            }
        };
        if envelope.device_id == self.device_id {
            return;
        }
        if let Some(message_id) = envelope.payload.message_id()
            && !self.seen.insert(message_id)
        {
            tracing::debug!(%message_id, "duplicate message dropped");
            return;
        }

        let heartbeat = matches!(envelope.payload, Payload::Heartbeat { .. });
        let now = self.clock.now_ms();
        let observation = self.peers.observe(
            envelope.device_id,
            datagram.from,
            now,
            heartbeat,
            envelope.payload.state_hash(),
        );
        if let Some((from, to)) = observation.phase_change {
            tracing::info!(peer = %envelope.device_id, %from, %to, "peer phase change");
        }
        if let Some(record) = self.peers.get(&envelope.device_id).cloned()
            && let Err(e) = self.store.upsert_peer(&record)
        {
            tracing::warn!("peer persist failed: {e}");
        }
        if observation.newly_known {
            tracing::info!(peer = %envelope.device_id, ip = %datagram.from, "new peer discovered");
            self.broadcast_state_request();
        }

        match envelope.payload {
            Payload::Delta { message_id, deltas } => {
                self.on_delta(envelope.device_id, datagram.from, message_id, deltas);
            }
            Payload::FullState { full_state } => self.on_full_state(&full_state),
            Payload::StateRequest => self.send_full_state(),
            Payload::Ack { ack_message_id } => {
                self.pending.remove(&(ack_message_id, envelope.device_id));
            }
            Payload::Heartbeat { .. } => {}
            Payload::StateHash { state_hash } => {
                self.on_state_hash(envelope.device_id, &state_hash);
            }
        }
    }

    fn on_delta(
        &mut self,
        from: DeviceId,
        from_ip: IpAddr,
        message_id: MessageId,
        deltas: Vec<ScanEvent>,
    ) {
        let fresh = self.replica.merge_deltas(deltas);
        if !fresh.is_empty() {
            if let Err(e) = self.store.append_scans_batch(&fresh) {
                tracing::warn!("scan persist failed (replica retains the events): {e}");
            }
            for event in &fresh {
                self.passes.record_scan(event);
            }
            self.last_sync_ms = Some(self.clock.now_ms());
            tracing::info!(peer = %from, count = fresh.len(), "merged delta");
        }

        // Exactly one ACK per received delta, fresh or not.
        let envelope = self.next_envelope(Payload::Ack {
            ack_message_id: message_id,
        });
        match wire::encode(&envelope) {
            Ok(bytes) => {
                if let Err(e) = self.transport.send_unicast(&bytes, from_ip) {
                    tracing::warn!(%from_ip, "ack send failed: {e}");
                }
            }
            Err(e) => tracing::warn!("ack encode failed: {e}"),
        }
    }

    fn on_full_state(&mut self, remote: &ReplicaView) {
        for (code, snap) in remote {
            if self.passes.learn(code, snap.pass_type)
                && let Some(rule) = self.passes.get(code).cloned()
                && let Err(e) = self.store.upsert_pass_type(code, &rule)
            {
                tracing::warn!(code = %code, "pass type persist failed: {e}");
            }
        }
        let fresh = self.replica.merge_full_state(remote);
        if !fresh.is_empty() {
            if let Err(e) = self.store.append_scans_batch(&fresh) {
                tracing::warn!("scan persist failed (replica retains the events): {e}");
            }
            for event in &fresh {
                self.passes.record_scan(event);
            }
            tracing::info!(count = fresh.len(), "merged full state");
        }
        self.last_sync_ms = Some(self.clock.now_ms());
    }

    fn on_state_hash(&mut self, from: DeviceId, remote_hash: &str) {
        let local = self.replica.state_hash();
        if local == remote_hash {
            self.peers.mark_synced(&from);
            self.last_sync_ms = Some(self.clock.now_ms());
        } else {
            tracing::debug!(peer = %from, %local, remote = remote_hash, "state hash mismatch");
            self.peers.mark_unsynced(&from);
            self.broadcast_state_request();
        }
    }

    // === Local operations ===

    pub(crate) fn submit_scan(&mut self, code: &str) -> ScanOutcome {
        let now = self.clock.now_ms();
        let day = DayKey::from_ms_local(now);
        let outcome = admission::evaluate(
            &self.passes,
            &self.replica,
            code,
            &day,
            now,
            self.cooldown_ms,
        );
        if !outcome.allowed {
            tracing::info!(code, reason = %outcome.reason.expect("deny has reason"), "scan denied");
            return outcome;
        }

        let event = self
            .replica
            .apply_local(self.ids.scan_id(), self.device_id, code, day, now);
        if let Err(e) = self.store.append_scan(&event) {
            tracing::warn!("scan persist failed (replica retains the event): {e}");
        }
        self.passes.record_scan(&event);
        tracing::info!(code, scan_id = %event.scan_id, "scan admitted");
        self.disseminate_delta(vec![event]);
        outcome
    }

    /// ACK-tracked dissemination: unicast to every addressed peer, falling
    /// back to an untracked broadcast when nobody is known yet.
    fn disseminate_delta(&mut self, events: Vec<ScanEvent>) {
        let message_id = self.ids.message_id();
        let envelope = self.next_envelope(Payload::Delta {
            message_id,
            deltas: events,
        });
        let bytes = match wire::encode_bounded(&envelope, self.max_datagram) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("delta encode failed: {e}");
                return;
            }
        };

        let targets = self.peers.addressed();
        if targets.is_empty() {
            self.broadcast(&bytes);
            return;
        }
        for (peer, ip) in targets {
            match self.transport.send_unicast(&bytes, ip) {
                Ok(()) => {
                    self.pending.insert(
                        (message_id, peer),
                        PendingSend {
                            payload: bytes.clone(),
                            ip,
                            sent_at: Instant::now(),
                            attempts: 1,
                        },
                    );
                }
                Err(e) => {
                    tracing::warn!(%ip, "delta unicast failed, queueing for broadcast: {e}");
                    self.enqueue_broadcast(&bytes);
                }
            }
        }
    }

    pub(crate) fn broadcast_state_request(&mut self) {
        self.send_to_all(Payload::StateRequest);
    }

    fn send_full_state(&mut self) {
        self.send_to_all(Payload::FullState {
            full_state: self.replica.view(),
        });
    }

    // === Timers ===

    pub(crate) fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Heartbeat => self.on_heartbeat(),
            TimerKind::RetryAck => self.on_retry_ack(),
            TimerKind::StateHash => self.on_state_hash_timer(),
            TimerKind::FullSync => self.send_full_state(),
            TimerKind::RetryQueue => self.on_retry_queue(),
        }
    }

    fn on_heartbeat(&mut self) {
        let now = self.clock.now_ms();
        for peer in self.peers.sweep(now) {
            tracing::info!(peer = %peer, "peer lost");
            if let Some(record) = self.peers.get(&peer).cloned()
                && let Err(e) = self.store.upsert_peer(&record)
            {
                tracing::warn!("peer persist failed: {e}");
            }
        }

        let targets = self.peers.live_addressed(now);
        if targets.is_empty() {
            return;
        }
        let envelope = self.next_envelope(Payload::Heartbeat {
            state_hash: self.replica.state_hash(),
        });
        match wire::encode(&envelope) {
            Ok(bytes) => {
                for (_, ip) in targets {
                    self.unicast(&bytes, ip);
                }
            }
            Err(e) => tracing::warn!("heartbeat encode failed: {e}"),
        }
    }

    fn on_retry_ack(&mut self) {
        let now = Instant::now();
        let mut to_drop = Vec::new();
        let mut to_resend = Vec::new();
        for (key, pending) in &self.pending {
            if now.duration_since(pending.sent_at) <= self.ack_timeout {
                continue;
            }
            if pending.attempts >= self.max_attempts {
                to_drop.push(*key);
            } else {
                to_resend.push((*key, pending.payload.clone(), pending.ip));
            }
        }

        for key in to_drop {
            self.pending.remove(&key);
            tracing::warn!(
                peer = %key.1,
                attempts = self.max_attempts,
                "delta unacknowledged, giving up"
            );
        }
        for (key, payload, ip) in to_resend {
            if let Err(e) = self.transport.send_unicast(&payload, ip) {
                tracing::warn!(%ip, "delta resend failed: {e}");
            }
            if let Some(pending) = self.pending.get_mut(&key) {
                pending.attempts += 1;
                pending.sent_at = now;
            }
        }
    }

    fn on_state_hash_timer(&mut self) {
        let targets = self.peers.addressed();
        if targets.is_empty() {
            return;
        }
        let envelope = self.next_envelope(Payload::StateHash {
            state_hash: self.replica.state_hash(),
        });
        match wire::encode(&envelope) {
            Ok(bytes) => {
                for (_, ip) in targets {
                    self.unicast(&bytes, ip);
                }
            }
            Err(e) => tracing::warn!("state hash encode failed: {e}"),
        }
    }

    fn on_retry_queue(&mut self) {
        let batch = match self.store.next_broadcasts(self.max_attempts, self.retry_batch) {
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!("retry queue read failed: {e}");
                return;
            }
        };
        for entry in batch {
            match self.transport.send_broadcast(&entry.payload) {
                Ok(()) => {
                    if let Err(e) = self.store.delete_broadcast(entry.id) {
                        tracing::warn!("retry queue delete failed: {e}");
                    }
                }
                Err(e) => {
                    tracing::debug!(id = entry.id, "queued broadcast retry failed: {e}");
                    if entry.attempts + 1 >= self.max_attempts {
                        tracing::warn!(id = entry.id, "queued broadcast exhausted, dropping");
                        if let Err(e) = self.store.delete_broadcast(entry.id) {
                            tracing::warn!("retry queue delete failed: {e}");
                        }
                    } else if let Err(e) = self.store.bump_broadcast_attempts(entry.id) {
                        tracing::warn!("retry queue update failed: {e}");
                    }
                }
            }
        }
    }

    // === Queries ===

    pub(crate) fn view(&self) -> ReplicaView {
        self.replica.view()
    }

    pub(crate) fn config_snapshot(&self) -> PassSnapshot {
        self.snapshot.clone()
    }

    pub(crate) fn health(&self) -> Health {
        let now = self.clock.now_ms();
        Health {
            peers_connected: self.peers.connected_count(now),
            time_since_last_sync_s: self
                .last_sync_ms
                .map(|at| now.saturating_sub(at) / 1000),
            pending_broadcasts: self.store.broadcast_queue_len().unwrap_or(0),
            pending_acks: self.pending.len(),
        }
    }

    pub(crate) fn shutdown(&mut self) {
        self.transport.shutdown();
        tracing::info!("engine state stopped");
    }

    // === Send plumbing ===

    fn next_envelope(&mut self, payload: Payload) -> Envelope {
        self.seq += 1;
        Envelope {
            device_id: self.device_id,
            sequence_num: self.seq,
            timestamp: self.clock.now_ms(),
            payload,
        }
    }

    /// Outbound policy for messages addressed to the whole fleet: broadcast
    /// for state requests or while the peer table is empty, otherwise
    /// unicast to every addressed peer.
    fn send_to_all(&mut self, payload: Payload) {
        let is_state_request = matches!(payload, Payload::StateRequest);
        let kind = payload.kind();
        let envelope = self.next_envelope(payload);
        let bytes = match wire::encode_bounded(&envelope, self.max_datagram) {
            Ok(bytes) => bytes,
            Err(WireError::Oversized { len, max }) => {
                tracing::debug!(kind, len, max, "message over datagram bound, skipped; deltas and hash repair carry on");
                return;
            }
            Err(e) => {
                tracing::warn!(kind, "encode failed: {e}");
                return;
            }
        };

        if is_state_request || self.peers.is_empty() {
            self.broadcast(&bytes);
        } else {
            for (_, ip) in self.peers.addressed() {
                self.unicast(&bytes, ip);
            }
        }
    }

    fn broadcast(&mut self, bytes: &[u8]) {
        if let Err(e) = self.transport.send_broadcast(bytes) {
            // Environments that refuse SO_BROADCAST still reach known peers.
            let fallback = self.peers.addressed();
            if fallback.is_empty() {
                tracing::warn!("broadcast failed, queueing: {e}");
                self.enqueue_broadcast(bytes);
                return;
            }
            tracing::warn!(peers = fallback.len(), "broadcast failed, falling back to unicast: {e}");
            for (_, ip) in fallback {
                self.unicast(bytes, ip);
            }
        }
    }

    fn unicast(&mut self, bytes: &[u8], ip: IpAddr) {
        if let Err(e) = self.transport.send_unicast(bytes, ip) {
            tracing::warn!(%ip, "unicast failed, queueing for broadcast: {e}");
            self.enqueue_broadcast(bytes);
        }
    }

    fn enqueue_broadcast(&mut self, bytes: &[u8]) {
        let now = self.clock.now_ms();
        if let Err(e) = self.store.enqueue_broadcast(bytes, now) {
            tracing::warn!("broadcast queue write failed: {e}");
        }
    }

    /// Drain and process everything waiting on the transport. Test-only:
    /// the state loop selects on the channel directly.
    #[cfg(test)]
    pub(crate) fn pump(&mut self) -> usize {
        let inbox = self.transport.incoming();
        let mut handled = 0;
        while let Ok(datagram) = inbox.try_recv() {
            self.handle_datagram(datagram);
            handled += 1;
        }
        handled
    }
}

fn load_snapshot(config: &Config, store: &mut Store) -> crate::Result<PassSnapshot> {
    if let Some(json) = store.load_pass_snapshot()? {
        return PassSnapshot::from_json(&json).map_err(|e| crate::Error::Config {
            reason: format!("persisted pass snapshot is corrupt: {e}"),
        });
    }

    let snapshot = match &config.passes_path {
        Some(path) => {
            let raw = std::fs::read_to_string(path).map_err(|e| crate::Error::Config {
                reason: format!("failed to read pass snapshot {}: {e}", path.display()),
            })?;
            PassSnapshot::from_json(&raw).map_err(|e| crate::Error::Config {
                reason: format!("failed to parse pass snapshot {}: {e}", path.display()),
            })?
        }
        None => PassSnapshot::default(),
    };

    let json = snapshot.to_json().map_err(|e| crate::Error::Config {
        reason: format!("failed to render pass snapshot: {e}"),
    })?;
    store.save_pass_snapshot(&json)?;
    for (code, entry) in &snapshot.passes {
        let rule = PassRule {
            pass_type: entry.pass_type,
            days: entry.days.clone(),
            uses: entry.count.unwrap_or(0),
        };
        store.upsert_pass_type(code, &rule)?;
    }
    tracing::info!(passes = snapshot.passes.len(), "pass snapshot installed");
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use uuid::Uuid;

    use crate::core::{CodeSnapshot, PassEntry, PassType, ScanId};
    use crate::testkit::{ManualClock, MemoryHub, MemoryTransport, SeqIds};

    use super::*;

    const T0: u64 = 1_731_585_600_000; // 2024-11-14 12:00:00 UTC

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    fn snapshot(codes: &[(&str, PassType)]) -> PassSnapshot {
        let passes = codes
            .iter()
            .map(|(code, pass_type)| {
                (
                    code.to_string(),
                    PassEntry {
                        pass_type: *pass_type,
                        days: None,
                        count: None,
                    },
                )
            })
            .collect();
        PassSnapshot { passes }
    }

    fn build(
        hub: &MemoryHub,
        ip_last: u8,
        clock: ManualClock,
        codes: &[(&str, PassType)],
    ) -> EngineState {
        // Disjoint id ranges per simulated device.
        let ids = SeqIds::with_base(ip_last as u64 * 1_000);
        let mut store = Store::open_in_memory().unwrap();
        store
            .save_pass_snapshot(&snapshot(codes).to_json().unwrap())
            .unwrap();
        let transport = Box::new(hub.join(ip(ip_last)));
        EngineState::boot(
            &Config::default(),
            store,
            transport,
            Arc::new(clock),
            Arc::new(ids),
        )
        .unwrap()
    }

    /// A hand-driven fake peer on the hub.
    struct FakePeer {
        device_id: DeviceId,
        transport: MemoryTransport,
        seq: u64,
    }

    impl FakePeer {
        fn join(hub: &MemoryHub, ip_last: u8, seed: u8) -> Self {
            Self {
                device_id: DeviceId::new(Uuid::from_bytes([seed; 16])),
                transport: hub.join(ip(ip_last)),
                seq: 0,
            }
        }

        fn send(&mut self, to: IpAddr, payload: Payload) {
            self.seq += 1;
            let envelope = Envelope {
                device_id: self.device_id,
                sequence_num: self.seq,
                timestamp: T0,
                payload,
            };
            self.transport
                .send_unicast(&wire::encode(&envelope).unwrap(), to)
                .unwrap();
        }

        fn drain(&self) -> Vec<Envelope> {
            let mut out = Vec::new();
            while let Ok(datagram) = self.transport.incoming().try_recv() {
                out.push(wire::decode(&datagram.bytes).unwrap());
            }
            out
        }

        fn delta(&mut self, to: IpAddr, message_seed: u8, event: ScanEvent) {
            self.send(
                to,
                Payload::Delta {
                    message_id: MessageId::new(Uuid::from_bytes([message_seed; 16])),
                    deltas: vec![event],
                },
            );
        }
    }

    fn remote_event(seed: u8, code: &str, device: DeviceId) -> ScanEvent {
        ScanEvent {
            scan_id: ScanId::new(Uuid::from_bytes([seed; 16])),
            code: code.into(),
            ts_ms: T0,
            device_id: device,
            day: DayKey::from_ms_local(T0),
        }
    }

    #[test]
    fn delta_is_merged_persisted_and_acked() {
        let hub = MemoryHub::new();
        let mut state = build(&hub, 1, ManualClock::at(T0), &[("A", PassType::Infinite)]);
        let mut peer = FakePeer::join(&hub, 2, 0x99);

        peer.delta(ip(1), 0x41, remote_event(0x10, "A", peer.device_id));
        state.pump();

        assert_eq!(state.replica.len(), 1);
        assert_eq!(state.store.scan_count().unwrap(), 1);

        let inbound = peer.drain();
        let acks: Vec<_> = inbound
            .iter()
            .filter_map(|env| match &env.payload {
                Payload::Ack { ack_message_id } => Some(*ack_message_id),
                _ => None,
            })
            .collect();
        assert_eq!(acks, vec![MessageId::new(Uuid::from_bytes([0x41; 16]))]);
        // The unknown sender also triggered a pull.
        assert!(
            inbound
                .iter()
                .any(|env| matches!(env.payload, Payload::StateRequest))
        );
    }

    #[test]
    fn duplicate_delta_is_dropped_without_a_second_ack() {
        let hub = MemoryHub::new();
        let mut state = build(&hub, 1, ManualClock::at(T0), &[("A", PassType::Infinite)]);
        let mut peer = FakePeer::join(&hub, 2, 0x99);

        peer.delta(ip(1), 0x41, remote_event(0x10, "A", peer.device_id));
        peer.delta(ip(1), 0x41, remote_event(0x10, "A", peer.device_id));
        state.pump();

        assert_eq!(state.replica.len(), 1);
        let ack_count = peer
            .drain()
            .iter()
            .filter(|env| matches!(env.payload, Payload::Ack { .. }))
            .count();
        assert_eq!(ack_count, 1);
    }

    #[test]
    fn own_datagrams_are_ignored() {
        let hub = MemoryHub::new();
        let mut state = build(&hub, 1, ManualClock::at(T0), &[]);

        let envelope = Envelope {
            device_id: state.device_id(),
            sequence_num: 1,
            timestamp: T0,
            payload: Payload::StateRequest,
        };
        state.handle_datagram(Datagram {
            bytes: wire::encode(&envelope).unwrap(),
            from: ip(1),
        });
        assert_eq!(state.peers.len(), 0);
    }

    #[test]
    fn malformed_datagrams_are_dropped_silently() {
        let hub = MemoryHub::new();
        let mut state = build(&hub, 1, ManualClock::at(T0), &[]);
        state.handle_datagram(Datagram {
            bytes: b"{not json".to_vec(),
            from: ip(2),
        });
        assert_eq!(state.peers.len(), 0);
    }

    #[test]
    fn state_hash_match_marks_peer_synced() {
        let hub = MemoryHub::new();
        let mut state = build(&hub, 1, ManualClock::at(T0), &[]);
        let mut peer = FakePeer::join(&hub, 2, 0x99);

        peer.send(
            ip(1),
            Payload::StateHash {
                state_hash: "empty".into(),
            },
        );
        state.pump();

        assert_eq!(
            state.peers.get(&peer.device_id).unwrap().phase,
            crate::core::PeerPhase::Synced
        );
        assert!(state.health().time_since_last_sync_s.is_some());
    }

    #[test]
    fn state_hash_mismatch_requests_state() {
        let hub = MemoryHub::new();
        let mut state = build(&hub, 1, ManualClock::at(T0), &[]);
        let mut peer = FakePeer::join(&hub, 2, 0x99);

        peer.send(
            ip(1),
            Payload::StateHash {
                state_hash: "7-deadbeef-deadbeef".into(),
            },
        );
        state.pump();

        let requests = peer
            .drain()
            .iter()
            .filter(|env| matches!(env.payload, Payload::StateRequest))
            .count();
        // One for the unknown peer, one for the mismatch.
        assert_eq!(requests, 2);
    }

    #[test]
    fn state_request_is_answered_with_full_state() {
        let hub = MemoryHub::new();
        let mut state = build(&hub, 1, ManualClock::at(T0), &[("A", PassType::OneUse)]);
        assert!(state.submit_scan("A").allowed);

        let mut peer = FakePeer::join(&hub, 2, 0x99);
        peer.send(ip(1), Payload::StateRequest);
        state.pump();

        let full_states: Vec<_> = peer
            .drain()
            .into_iter()
            .filter_map(|env| match env.payload {
                Payload::FullState { full_state } => Some(full_state),
                _ => None,
            })
            .collect();
        assert_eq!(full_states.len(), 1);
        assert_eq!(full_states[0]["A"].pass_type, PassType::OneUse);
        assert_eq!(full_states[0]["A"].scans.len(), 1);
    }

    #[test]
    fn full_state_teaches_unknown_codes() {
        let hub = MemoryHub::new();
        let mut state = build(&hub, 1, ManualClock::at(T0), &[]);
        let mut peer = FakePeer::join(&hub, 2, 0x99);

        let mut full_state = BTreeMap::new();
        full_state.insert(
            "VIP".to_string(),
            CodeSnapshot {
                pass_type: PassType::OneUse,
                scans: vec![remote_event(0x20, "VIP", peer.device_id)],
            },
        );
        peer.send(ip(1), Payload::FullState { full_state });
        state.pump();

        assert_eq!(state.replica.len(), 1);
        assert_eq!(
            state.passes.get("VIP").unwrap().pass_type,
            PassType::OneUse
        );
        // Learned codes admit now.
        let outcome = state.submit_scan("VIP");
        assert!(!outcome.allowed, "one-use already spent today");
    }

    #[test]
    fn submit_broadcasts_untracked_when_no_peers_known() {
        let hub = MemoryHub::new();
        let mut state = build(&hub, 1, ManualClock::at(T0), &[("A", PassType::Infinite)]);
        let observer = FakePeer::join(&hub, 9, 0x77);

        let outcome = state.submit_scan("A");
        assert!(outcome.allowed);
        assert_eq!(outcome.today_count, 0);
        assert!(state.pending.is_empty());

        let deltas: Vec<_> = observer
            .drain()
            .into_iter()
            .filter(|env| matches!(env.payload, Payload::Delta { .. }))
            .collect();
        assert_eq!(deltas.len(), 1);
    }

    #[test]
    fn submit_unicasts_with_ack_tracking_when_peers_known() {
        let hub = MemoryHub::new();
        let mut state = build(&hub, 1, ManualClock::at(T0), &[("A", PassType::Infinite)]);
        let mut peer = FakePeer::join(&hub, 2, 0x99);

        // Introduce the peer.
        peer.send(
            ip(1),
            Payload::Heartbeat {
                state_hash: "empty".into(),
            },
        );
        state.pump();
        peer.drain();

        assert!(state.submit_scan("A").allowed);
        assert_eq!(state.pending.len(), 1);
        assert_eq!(state.health().pending_acks, 1);

        let delta_ids: Vec<_> = peer
            .drain()
            .into_iter()
            .filter_map(|env| env.payload.message_id())
            .collect();
        assert_eq!(delta_ids.len(), 1);

        peer.send(
            ip(1),
            Payload::Ack {
                ack_message_id: delta_ids[0],
            },
        );
        state.pump();
        assert!(state.pending.is_empty());
    }

    #[test]
    fn unacked_delta_is_resent_then_dropped() {
        let hub = MemoryHub::new();
        let mut config = Config::default();
        config.gossip.ack_timeout_ms = 1;
        config.gossip.max_send_attempts = 2;
        let mut store = Store::open_in_memory().unwrap();
        store
            .save_pass_snapshot(&snapshot(&[("A", PassType::Infinite)]).to_json().unwrap())
            .unwrap();
        let mut state = EngineState::boot(
            &config,
            store,
            Box::new(hub.join(ip(1))),
            Arc::new(ManualClock::at(T0)),
            Arc::new(SeqIds::new()),
        )
        .unwrap();
        let mut peer = FakePeer::join(&hub, 2, 0x99);

        peer.send(
            ip(1),
            Payload::Heartbeat {
                state_hash: "empty".into(),
            },
        );
        state.pump();
        peer.drain();

        assert!(state.submit_scan("A").allowed);
        assert_eq!(state.pending.len(), 1);

        std::thread::sleep(Duration::from_millis(10));
        state.on_timer(TimerKind::RetryAck);
        assert_eq!(state.pending.len(), 1, "resent, still pending");
        let resends = peer
            .drain()
            .into_iter()
            .filter(|env| matches!(env.payload, Payload::Delta { .. }))
            .count();
        assert_eq!(resends, 2, "original send plus one retry");

        std::thread::sleep(Duration::from_millis(10));
        state.on_timer(TimerKind::RetryAck);
        assert!(state.pending.is_empty(), "attempt cap reached, dropped");
    }

    #[test]
    fn one_use_double_swipe_converges_and_then_denies() {
        let hub = MemoryHub::new();
        let clock = ManualClock::at(T0);
        let mut a = build(&hub, 1, clock.clone(), &[("W", PassType::OneUse)]);
        let mut b = build(&hub, 2, clock.clone(), &[("W", PassType::OneUse)]);

        // Simultaneous local accepts before any exchange: both allowed.
        assert!(a.submit_scan("W").allowed);
        assert!(b.submit_scan("W").allowed);

        // Broadcast deltas cross; each side merges the other's event and the
        // discovery state-requests produce full-state exchanges.
        for _ in 0..4 {
            a.pump();
            b.pump();
        }

        assert_eq!(a.replica.scans_for("W").len(), 2);
        assert_eq!(b.replica.scans_for("W").len(), 2);
        assert_eq!(a.replica.state_hash(), b.replica.state_hash());

        // Any further swipe anywhere is refused.
        clock.advance(60_000);
        assert!(!a.submit_scan("W").allowed);
        assert!(!b.submit_scan("W").allowed);
    }

    #[test]
    fn full_sync_timer_broadcasts_when_alone() {
        let hub = MemoryHub::new();
        let mut state = build(&hub, 1, ManualClock::at(T0), &[("A", PassType::Infinite)]);
        let observer = FakePeer::join(&hub, 9, 0x77);

        state.submit_scan("A");
        observer.drain();
        state.on_timer(TimerKind::FullSync);

        let full_states = observer
            .drain()
            .into_iter()
            .filter(|env| matches!(env.payload, Payload::FullState { .. }))
            .count();
        assert_eq!(full_states, 1);
    }
}
