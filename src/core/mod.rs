//! Core domain layer: identities, time, events, passes, peers, and the
//! replica CRDT. No I/O lives here.

pub mod error;
pub mod event;
pub mod identity;
pub mod passes;
pub mod peer;
pub mod replica;
pub mod time;

pub use error::{CoreError, InvalidId};
pub use event::ScanEvent;
pub use identity::{DeviceId, IdSource, MessageId, ScanId, UuidIds};
pub use passes::{PassBook, PassEntry, PassRule, PassSnapshot, PassType};
pub use peer::{PeerPhase, PeerRecord};
pub use replica::{CodeSnapshot, ReplicaState, ReplicaView};
pub use time::{DayKey, SystemClock, WallClockSource, system_clock};
