//! Network layer: wire codec, datagram transport, peer table.

pub mod peers;
pub mod transport;
pub mod wire;

pub use peers::PeerTable;
pub use transport::{DEFAULT_PORT, Datagram, Transport, TransportError, UdpTransport};
pub use wire::{Envelope, Payload, WireError};
