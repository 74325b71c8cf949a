//! The scan event: the sole replicated atom.
//!
//! Immutable once created. Set membership in the replica is keyed by
//! `scan_id`; the `(ts_ms, device_id)` pair only orders the cached view.
//!
//! Wire field names (`scanId`, `qrCode`, `timestamp`, `deviceId`, `date`)
//! are pinned for cross-version compatibility and must not change.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::error::CoreError;
use super::identity::{DeviceId, ScanId};
use super::time::DayKey;

/// Immutable record of a single code read.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanEvent {
    #[serde(rename = "scanId")]
    pub scan_id: ScanId,
    #[serde(rename = "qrCode")]
    pub code: String,
    #[serde(rename = "timestamp")]
    pub ts_ms: u64,
    #[serde(rename = "deviceId")]
    pub device_id: DeviceId,
    #[serde(rename = "date")]
    pub day: DayKey,
}

impl ScanEvent {
    /// Reject events that violate the data-model invariants before they
    /// enter the replica or the store.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.code.is_empty() {
            return Err(CoreError::InvalidEvent {
                reason: "empty code".into(),
            });
        }
        Ok(())
    }

    /// Presentation order within a code: `(ts_ms, device_id)` ascending.
    pub fn order_key(&self) -> (u64, DeviceId) {
        (self.ts_ms, self.device_id)
    }

    pub fn cmp_order(&self, other: &Self) -> Ordering {
        self.order_key().cmp(&other.order_key())
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn event(ts_ms: u64, device: u8) -> ScanEvent {
        ScanEvent {
            scan_id: ScanId::new(Uuid::from_bytes([7u8; 16])),
            code: "CODE-1".into(),
            ts_ms,
            device_id: DeviceId::new(Uuid::from_bytes([device; 16])),
            day: DayKey::parse("14nov").unwrap(),
        }
    }

    #[test]
    fn wire_field_names_are_stable() {
        let json = serde_json::to_value(event(1000, 1)).unwrap();
        let obj = json.as_object().unwrap();
        for key in ["scanId", "qrCode", "timestamp", "deviceId", "date"] {
            assert!(obj.contains_key(key), "missing wire field {key}");
        }
        assert_eq!(obj.len(), 5);
        assert_eq!(json["qrCode"], "CODE-1");
        assert_eq!(json["timestamp"], 1000);
        assert_eq!(json["date"], "14nov");
    }

    #[test]
    fn wire_roundtrip() {
        let e = event(42, 3);
        let bytes = serde_json::to_vec(&e).unwrap();
        let back: ScanEvent = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn validate_rejects_empty_code() {
        let mut e = event(1, 1);
        e.code.clear();
        assert!(e.validate().is_err());
    }

    #[test]
    fn order_is_ts_then_device() {
        let early = event(1, 9);
        let late = event(2, 1);
        assert_eq!(early.cmp_order(&late), Ordering::Less);

        let a = event(5, 1);
        let b = event(5, 2);
        assert_eq!(a.cmp_order(&b), Ordering::Less);
    }
}
