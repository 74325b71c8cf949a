//! Pass-type projection: which codes exist and how they admit.
//!
//! Seeded from the bundled snapshot on first run, then rebuilt
//! deterministically from the persisted snapshot union the scan log.
//! `full-state` messages may declare types for codes the snapshot never
//! named; plain deltas never create entries here.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::event::ScanEvent;
use super::time::DayKey;

/// How a code admits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PassType {
    /// Unlimited scans, subject only to the cooldown.
    #[serde(rename = "infinite")]
    Infinite,
    /// At most one accepted scan per event-day.
    #[serde(rename = "one-use")]
    OneUse,
}

impl PassType {
    pub fn as_str(self) -> &'static str {
        match self {
            PassType::Infinite => "infinite",
            PassType::OneUse => "one-use",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "infinite" => Some(PassType::Infinite),
            "one-use" => Some(PassType::OneUse),
            _ => None,
        }
    }
}

impl fmt::Display for PassType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One code's entry in the bundled configuration snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassEntry {
    #[serde(rename = "type")]
    pub pass_type: PassType,
    /// Event-days this pass is flagged for. Carried for the reporting
    /// shell; the admission predicate does not consult it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days: Option<Vec<DayKey>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}

/// The immutable configuration snapshot: code -> pass entry.
///
/// Loaded from the bundled JSON on first run and persisted verbatim in the
/// store's settings table; `query_config` returns it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassSnapshot {
    #[serde(default)]
    pub passes: BTreeMap<String, PassEntry>,
}

impl PassSnapshot {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Live projection row for one code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PassRule {
    pub pass_type: PassType,
    pub days: Option<Vec<DayKey>>,
    /// Scans observed for this code (local + replicated).
    pub uses: u64,
}

/// The pass-type map: projection of the snapshot union the scan log.
#[derive(Clone, Debug, Default)]
pub struct PassBook {
    rules: BTreeMap<String, PassRule>,
}

impl PassBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deterministic rebuild: snapshot defaults first, then replay the log.
    pub fn rebuild(snapshot: &PassSnapshot, log: &[ScanEvent]) -> Self {
        let mut book = Self::new();
        for (code, entry) in &snapshot.passes {
            book.rules.insert(
                code.clone(),
                PassRule {
                    pass_type: entry.pass_type,
                    days: entry.days.clone(),
                    uses: entry.count.unwrap_or(0),
                },
            );
        }
        for event in log {
            book.record_scan(event);
        }
        book
    }

    pub fn get(&self, code: &str) -> Option<&PassRule> {
        self.rules.get(code)
    }

    pub fn contains(&self, code: &str) -> bool {
        self.rules.contains_key(code)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PassRule)> {
        self.rules.iter()
    }

    /// Learn a code's type from a full-state snapshot. Existing entries keep
    /// their configured type; snapshots only fill gaps.
    pub fn learn(&mut self, code: &str, pass_type: PassType) -> bool {
        if self.rules.contains_key(code) {
            return false;
        }
        self.rules.insert(
            code.to_string(),
            PassRule {
                pass_type,
                days: None,
                uses: 0,
            },
        );
        true
    }

    /// Bump the use counter for a newly learned event. Codes outside the
    /// map are left untouched; deltas carry no type information.
    pub fn record_scan(&mut self, event: &ScanEvent) {
        if let Some(rule) = self.rules.get_mut(&event.code) {
            rule.uses += 1;
        }
    }
}
