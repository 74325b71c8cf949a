//! Replica state: the in-memory CRDT projection.
//!
//! Per code, a grow-only set of scan events keyed by `scan_id`; merge is set
//! union. The per-code event sequence is a cached view kept sorted by
//! `(ts_ms, device_id)` — clock skew cannot affect membership, only display
//! order.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use super::event::ScanEvent;
use super::identity::{DeviceId, ScanId};
use super::passes::{PassBook, PassType};
use super::time::DayKey;

/// One code's slice of a full-state message or a local snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeSnapshot {
    #[serde(rename = "type")]
    pub pass_type: PassType,
    pub scans: Vec<ScanEvent>,
}

/// The whole-replica view: code -> (type, ordered events).
pub type ReplicaView = BTreeMap<String, CodeSnapshot>;

#[derive(Clone, Debug, Default)]
struct CodeSet {
    pass_type: Option<PassType>,
    /// Cached ordering, refreshed after every merge.
    events: Vec<ScanEvent>,
    ids: HashSet<ScanId>,
}

impl CodeSet {
    fn with_type(pass_type: Option<PassType>) -> Self {
        Self {
            pass_type,
            ..Self::default()
        }
    }

    /// Insert if the scan id is absent. Returns whether the event was new.
    fn insert(&mut self, event: ScanEvent) -> bool {
        if !self.ids.insert(event.scan_id) {
            return false;
        }
        self.events.push(event);
        true
    }

    fn refresh_order(&mut self) {
        self.events.sort_by(|a, b| a.cmp_order(b));
    }
}

/// The full in-memory projection of the scan log.
#[derive(Clone, Debug, Default)]
pub struct ReplicaState {
    codes: BTreeMap<String, CodeSet>,
    total: usize,
}

impl ReplicaState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from the pass-type map and the persisted log, at boot.
    pub fn seed(book: &PassBook, log: Vec<ScanEvent>) -> Self {
        let mut replica = Self::new();
        for (code, rule) in book.iter() {
            replica
                .codes
                .insert(code.clone(), CodeSet::with_type(Some(rule.pass_type)));
        }
        replica.merge_deltas(log);
        replica
    }

    /// Append a locally admitted scan. Callers construct the event with a
    /// fresh scan id; admission must already have accepted the code.
    pub fn apply_local(
        &mut self,
        scan_id: ScanId,
        device_id: DeviceId,
        code: &str,
        day: DayKey,
        now_ms: u64,
    ) -> ScanEvent {
        let event = ScanEvent {
            scan_id,
            code: code.to_string(),
            ts_ms: now_ms,
            device_id,
            day,
        };
        self.merge_deltas(vec![event.clone()]);
        event
    }

    /// Union incoming events into the replica. Returns the events actually
    /// newly learned, for persistence and projection updates.
    pub fn merge_deltas(&mut self, events: Vec<ScanEvent>) -> Vec<ScanEvent> {
        let mut fresh = Vec::new();
        for event in events {
            if event.validate().is_err() {
                continue;
            }
            let set = self.codes.entry(event.code.clone()).or_default();
            if set.insert(event.clone()) {
                self.total += 1;
                fresh.push(event);
            }
        }
        if !fresh.is_empty() {
            let touched: HashSet<&String> = fresh.iter().map(|e| &e.code).collect();
            for code in touched {
                if let Some(set) = self.codes.get_mut(code.as_str()) {
                    set.refresh_order();
                }
            }
        }
        fresh
    }

    /// Flatten a full-state snapshot into one delta list and merge it.
    /// Unknown codes are admitted with their declared type preserved.
    pub fn merge_full_state(&mut self, remote: &ReplicaView) -> Vec<ScanEvent> {
        let mut flattened = Vec::new();
        for (code, snap) in remote {
            let set = self
                .codes
                .entry(code.clone())
                .or_insert_with(|| CodeSet::with_type(Some(snap.pass_type)));
            if set.pass_type.is_none() {
                set.pass_type = Some(snap.pass_type);
            }
            flattened.extend(snap.scans.iter().cloned());
        }
        self.merge_deltas(flattened)
    }

    pub fn scans_for(&self, code: &str) -> &[ScanEvent] {
        self.codes.get(code).map(|s| s.events.as_slice()).unwrap_or(&[])
    }

    pub fn scans_for_day<'a>(
        &'a self,
        code: &str,
        day: &'a DayKey,
    ) -> impl Iterator<Item = &'a ScanEvent> {
        self.scans_for(code).iter().filter(move |e| e.day == *day)
    }

    /// Clone-out view for `query_state` and `full-state` messages. Codes the
    /// replica learned only from untyped deltas report as infinite.
    pub fn view(&self) -> ReplicaView {
        self.codes
            .iter()
            .map(|(code, set)| {
                (
                    code.clone(),
                    CodeSnapshot {
                        pass_type: set.pass_type.unwrap_or(PassType::Infinite),
                        scans: set.events.clone(),
                    },
                )
            })
            .collect()
    }

    /// Total event count across all codes.
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn contains(&self, code: &str, scan_id: ScanId) -> bool {
        self.codes
            .get(code)
            .is_some_and(|set| set.ids.contains(&scan_id))
    }

    /// Deterministic fingerprint of the entire event set:
    /// `"empty"`, or `"{N}-{min_id[0..8]}-{max_id[0..8]}"` with scan ids
    /// sorted ascending. Cheap divergence detection; peers must agree on
    /// the algorithm.
    pub fn state_hash(&self) -> String {
        let mut min: Option<ScanId> = None;
        let mut max: Option<ScanId> = None;
        for set in self.codes.values() {
            for id in &set.ids {
                match min {
                    Some(current) if *id >= current => {}
                    _ => min = Some(*id),
                }
                match max {
                    Some(current) if *id <= current => {}
                    _ => max = Some(*id),
                }
            }
        }
        match (min, max) {
            (Some(min), Some(max)) => {
                format!("{}-{}-{}", self.total, min.short(), max.short())
            }
            _ => "empty".to_string(),
        }
    }
}
