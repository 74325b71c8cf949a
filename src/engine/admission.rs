//! Admission: the local accept/reject decision for a candidate scan.
//!
//! A pure function of the replica snapshot and the clock. Never mutates
//! state; on allow, the engine appends, persists and disseminates.
//!
//! Concurrent accepts of the same one-use code on different devices are by
//! design: both events stay in the log, and reporting treats the pair as a
//! double-swipe record.

use std::fmt;

use serde::Serialize;

use crate::core::{DayKey, PassBook, PassType, ReplicaState};

/// Why a scan was refused. Not errors of the core: structured results.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DenyReason {
    Unknown,
    OneUseSpent,
    Cooldown,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DenyReason::Unknown => "unknown",
            DenyReason::OneUseSpent => "one-use already used today",
            DenyReason::Cooldown => "cooldown",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for DenyReason {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Result of `submit_scan` / `evaluate`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ScanOutcome {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenyReason>,
    /// Scans already recorded for this code today, before this one.
    pub today_count: usize,
}

impl ScanOutcome {
    fn allow(today_count: usize) -> Self {
        Self {
            allowed: true,
            reason: None,
            today_count,
        }
    }

    fn deny(reason: DenyReason, today_count: usize) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            today_count,
        }
    }
}

/// The admission predicate.
///
/// 1. unknown code -> deny
/// 2-3. collect today's scans for the code
/// 4. one-use with any scan today -> deny
/// 5. any scan inside the cooldown window -> deny
/// 6. allow, reporting today's count
pub fn evaluate(
    book: &PassBook,
    replica: &ReplicaState,
    code: &str,
    day: &DayKey,
    now_ms: u64,
    cooldown_ms: u64,
) -> ScanOutcome {
    let Some(rule) = book.get(code) else {
        return ScanOutcome::deny(DenyReason::Unknown, 0);
    };

    let today: Vec<_> = replica.scans_for_day(code, day).collect();

    if rule.pass_type == PassType::OneUse && !today.is_empty() {
        return ScanOutcome::deny(DenyReason::OneUseSpent, today.len());
    }

    let cutoff = now_ms.saturating_sub(cooldown_ms);
    if today.iter().any(|e| e.ts_ms > cutoff) {
        return ScanOutcome::deny(DenyReason::Cooldown, today.len());
    }

    ScanOutcome::allow(today.len())
}
