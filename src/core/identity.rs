//! Identity atoms.
//!
//! DeviceId: persistent device self-identification.
//! ScanId: globally-unique scan event identifier.
//! MessageId: per-message identifier for ACK tracking and dedup.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{CoreError, InvalidId};

macro_rules! uuid_id {
    ($name:ident, $variant:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn parse(s: &str) -> Result<Self, CoreError> {
                let raw = s.trim();
                Uuid::parse_str(raw).map(Self).map_err(|e| {
                    InvalidId::$variant {
                        raw: raw.to_string(),
                        reason: e.to_string(),
                    }
                    .into()
                })
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }

            /// Leading hex group, for log lines and the state hash.
            pub fn short(&self) -> String {
                let s = self.0.to_string();
                s[..8].to_string()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(DeviceId, Device, "Persistent device identity, generated once on first run.");
uuid_id!(ScanId, Scan, "Unique scan event id; set membership in the replica is keyed by it.");
uuid_id!(MessageId, Message, "Unique gossip message id, used for ACK matching and dedup.");

/// Source of fresh identifiers.
///
/// Injected so tests can substitute a deterministic sequence.
pub trait IdSource: Send + Sync {
    fn device_id(&self) -> DeviceId;
    fn scan_id(&self) -> ScanId;
    fn message_id(&self) -> MessageId;
}

/// Default source: random v4 UUIDs (122 bits of entropy).
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIds;

impl IdSource for UuidIds {
    fn device_id(&self) -> DeviceId {
        DeviceId(Uuid::new_v4())
    }

    fn scan_id(&self) -> ScanId {
        ScanId(Uuid::new_v4())
    }

    fn message_id(&self) -> MessageId {
        MessageId(Uuid::new_v4())
    }
}
