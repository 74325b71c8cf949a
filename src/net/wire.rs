//! Wire messages: UTF-8 JSON, one message per datagram.
//!
//! The envelope fields (`type`, `deviceId`, `sequenceNum`, `timestamp`) and
//! the per-kind conditional fields are pinned for cross-version
//! compatibility. Decoding is tagged-union strict: unknown kinds and
//! malformed payloads fail to parse and are dropped upstream.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{CodeSnapshot, DeviceId, MessageId, ScanEvent};
use crate::error::Transience;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("message decode failed: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("message encode failed: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("encoded message is {len} bytes, over the {max} byte datagram bound")]
    Oversized { len: usize, max: usize },
}

impl WireError {
    pub fn transience(&self) -> Transience {
        Transience::Permanent
    }
}

/// Common fields carried by every message, plus the kind-specific payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub device_id: DeviceId,
    /// Per-sender monotonic counter.
    pub sequence_num: u64,
    /// Sender wall clock, ms since the Unix epoch.
    pub timestamp: u64,
    #[serde(flatten)]
    pub payload: Payload,
}

/// The six message kinds, tagged on the wire by `type`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Payload {
    /// Newly learned scan events; requires an ACK.
    Delta {
        message_id: MessageId,
        deltas: Vec<ScanEvent>,
    },
    /// The sender's entire replica.
    FullState {
        full_state: BTreeMap<String, CodeSnapshot>,
    },
    /// Ask every reachable peer to send their full state.
    StateRequest,
    /// Acknowledges one delta.
    Ack { ack_message_id: MessageId },
    Heartbeat { state_hash: String },
    StateHash { state_hash: String },
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Delta { .. } => "delta",
            Payload::FullState { .. } => "full-state",
            Payload::StateRequest => "state-request",
            Payload::Ack { .. } => "ack",
            Payload::Heartbeat { .. } => "heartbeat",
            Payload::StateHash { .. } => "state-hash",
        }
    }

    /// The dedup/ACK-tracking id, present only on kinds that require
    /// acknowledgement.
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Payload::Delta { message_id, .. } => Some(*message_id),
            _ => None,
        }
    }

    /// The sender's state hash, on kinds that carry one.
    pub fn state_hash(&self) -> Option<&str> {
        match self {
            Payload::Heartbeat { state_hash } | Payload::StateHash { state_hash } => {
                Some(state_hash)
            }
            _ => None,
        }
    }
}

pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, WireError> {
    serde_json::to_vec(envelope).map_err(WireError::Encode)
}

/// Encode and enforce the single-datagram bound.
pub fn encode_bounded(envelope: &Envelope, max_bytes: usize) -> Result<Vec<u8>, WireError> {
    let bytes = encode(envelope)?;
    if bytes.len() > max_bytes {
        return Err(WireError::Oversized {
            len: bytes.len(),
            max: max_bytes,
        });
    }
    Ok(bytes)
}

pub fn decode(bytes: &[u8]) -> Result<Envelope, WireError> {
    serde_json::from_slice(bytes).map_err(WireError::Decode)
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use crate::core::{DayKey, PassType, ScanId};

    use super::*;

    fn device(seed: u8) -> DeviceId {
        DeviceId::new(Uuid::from_bytes([seed; 16]))
    }

    fn envelope(payload: Payload) -> Envelope {
        Envelope {
            device_id: device(1),
            sequence_num: 7,
            timestamp: 1_000,
            payload,
        }
    }

    fn sample_event() -> ScanEvent {
        ScanEvent {
            scan_id: ScanId::new(Uuid::from_bytes([2u8; 16])),
            code: "GOLD-1".into(),
            ts_ms: 999,
            device_id: device(1),
            day: DayKey::parse("14nov").unwrap(),
        }
    }

    #[test]
    fn delta_wire_shape() {
        let env = envelope(Payload::Delta {
            message_id: MessageId::new(Uuid::from_bytes([3u8; 16])),
            deltas: vec![sample_event()],
        });
        let value: serde_json::Value = serde_json::from_slice(&encode(&env).unwrap()).unwrap();
        assert_eq!(value["type"], "delta");
        assert_eq!(value["sequenceNum"], 7);
        assert_eq!(value["timestamp"], 1000);
        assert!(value["deviceId"].is_string());
        assert!(value["messageId"].is_string());
        assert_eq!(value["deltas"][0]["qrCode"], "GOLD-1");
    }

    #[test]
    fn every_kind_roundtrips() {
        let mut full_state = BTreeMap::new();
        full_state.insert(
            "GOLD-1".to_string(),
            CodeSnapshot {
                pass_type: PassType::OneUse,
                scans: vec![sample_event()],
            },
        );
        let payloads = vec![
            Payload::Delta {
                message_id: MessageId::new(Uuid::from_bytes([3u8; 16])),
                deltas: vec![sample_event()],
            },
            Payload::FullState { full_state },
            Payload::StateRequest,
            Payload::Ack {
                ack_message_id: MessageId::new(Uuid::from_bytes([4u8; 16])),
            },
            Payload::Heartbeat {
                state_hash: "empty".into(),
            },
            Payload::StateHash {
                state_hash: "1-02020202-02020202".into(),
            },
        ];
        for payload in payloads {
            let env = envelope(payload);
            let back = decode(&encode(&env).unwrap()).unwrap();
            assert_eq!(back, env);
        }
    }

    #[test]
    fn kind_tags_match_the_protocol() {
        let tags: Vec<&str> = [
            Payload::StateRequest,
            Payload::Heartbeat {
                state_hash: "empty".into(),
            },
            Payload::StateHash {
                state_hash: "empty".into(),
            },
        ]
        .iter()
        .map(|p| p.kind())
        .collect();
        assert_eq!(tags, vec!["state-request", "heartbeat", "state-hash"]);

        for payload in [
            Payload::StateRequest,
            Payload::Ack {
                ack_message_id: MessageId::new(Uuid::from_bytes([4u8; 16])),
            },
        ] {
            let env = envelope(payload);
            let value: serde_json::Value =
                serde_json::from_slice(&encode(&env).unwrap()).unwrap();
            assert_eq!(value["type"], env.payload.kind());
        }
    }

    #[test]
    fn decode_foreign_peer_json() {
        // As emitted by other fleet implementations.
        let raw = r#"{
            "type": "state-hash",
            "deviceId": "01010101-0101-0101-0101-010101010101",
            "sequenceNum": 42,
            "timestamp": 1731585600000,
            "stateHash": "empty"
        }"#;
        let env = decode(raw.as_bytes()).unwrap();
        assert_eq!(env.sequence_num, 42);
        assert_eq!(env.payload.state_hash(), Some("empty"));
    }

    #[test]
    fn decode_rejects_malformed_and_unknown() {
        assert!(decode(b"not json").is_err());
        assert!(decode(b"{}").is_err());
        let unknown = r#"{
            "type": "gossip-v2",
            "deviceId": "01010101-0101-0101-0101-010101010101",
            "sequenceNum": 1,
            "timestamp": 2
        }"#;
        assert!(decode(unknown.as_bytes()).is_err());
    }

    #[test]
    fn oversized_encode_is_refused() {
        let env = envelope(Payload::Heartbeat {
            state_hash: "x".repeat(512),
        });
        let err = encode_bounded(&env, 64).unwrap_err();
        assert!(matches!(err, WireError::Oversized { .. }));
    }
}
