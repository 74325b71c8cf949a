//! In-process fakes for driving an engine fleet deterministically:
//! a memory-backed transport hub with per-link loss, a manual wall clock,
//! and a sequential id source.
//!
//! These are the injection seams the engine exposes (`Engine::init_with`);
//! the integration suite and embedder simulations both build on them.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crossbeam::channel::{Receiver, Sender};
use uuid::Uuid;

use crate::core::{DeviceId, IdSource, MessageId, ScanId, WallClockSource};
use crate::net::{Datagram, Transport, TransportError};

/// Settable wall clock shared across engines in a test.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    ms: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn at(ms: u64) -> Self {
        let clock = Self::default();
        clock.set(ms);
        clock
    }

    pub fn set(&self, ms: u64) {
        self.ms.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: u64) {
        self.ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl WallClockSource for ManualClock {
    fn now_ms(&self) -> u64 {
        self.ms.load(Ordering::SeqCst)
    }
}

/// Deterministic id source: ids are consecutive integers, distinguishable
/// by a per-kind tag byte.
#[derive(Debug, Default)]
pub struct SeqIds {
    next: AtomicU64,
}

impl SeqIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start counting from `base`. Give each simulated device a disjoint
    /// range so ids never collide across the fleet.
    pub fn with_base(base: u64) -> Self {
        Self {
            next: AtomicU64::new(base),
        }
    }

    fn make(&self, tag: u8) -> Uuid {
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        let mut bytes = [0u8; 16];
        bytes[0] = tag;
        bytes[8..].copy_from_slice(&n.to_be_bytes());
        Uuid::from_bytes(bytes)
    }
}

impl IdSource for SeqIds {
    fn device_id(&self) -> DeviceId {
        DeviceId::new(self.make(0xd0))
    }

    fn scan_id(&self) -> ScanId {
        ScanId::new(self.make(0x5c))
    }

    fn message_id(&self) -> MessageId {
        MessageId::new(self.make(0x3e))
    }
}

#[derive(Default)]
struct Hub {
    members: HashMap<IpAddr, Sender<Datagram>>,
    /// Directed links currently dropping every datagram.
    cut: HashSet<(IpAddr, IpAddr)>,
}

/// An in-process datagram network. Broadcast reaches every member except
/// the sender; severed links drop silently, like a lossy LAN.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<Hub>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a member at `ip` and hand back its transport.
    pub fn join(&self, ip: IpAddr) -> MemoryTransport {
        let (tx, rx) = crossbeam::channel::unbounded();
        self.inner
            .lock()
            .expect("hub lock")
            .members
            .insert(ip, tx);
        MemoryTransport {
            ip,
            hub: Arc::clone(&self.inner),
            rx,
        }
    }

    /// Start dropping all datagrams from `from` to `to`.
    pub fn sever(&self, from: IpAddr, to: IpAddr) {
        self.inner.lock().expect("hub lock").cut.insert((from, to));
    }

    /// Restore the `from` -> `to` link.
    pub fn heal(&self, from: IpAddr, to: IpAddr) {
        self.inner.lock().expect("hub lock").cut.remove(&(from, to));
    }
}

pub struct MemoryTransport {
    ip: IpAddr,
    hub: Arc<Mutex<Hub>>,
    rx: Receiver<Datagram>,
}

impl MemoryTransport {
    pub fn ip(&self) -> IpAddr {
        self.ip
    }
}

impl Transport for MemoryTransport {
    fn send_broadcast(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let hub = self.hub.lock().expect("hub lock");
        for (addr, tx) in &hub.members {
            if *addr == self.ip || hub.cut.contains(&(self.ip, *addr)) {
                continue;
            }
            let _ = tx.send(Datagram {
                bytes: payload.to_vec(),
                from: self.ip,
            });
        }
        Ok(())
    }

    fn send_unicast(&mut self, payload: &[u8], to: IpAddr) -> Result<(), TransportError> {
        let hub = self.hub.lock().expect("hub lock");
        // Unknown destinations and severed links lose the datagram, exactly
        // as UDP would.
        if hub.cut.contains(&(self.ip, to)) {
            return Ok(());
        }
        if let Some(tx) = hub.members.get(&to) {
            let _ = tx.send(Datagram {
                bytes: payload.to_vec(),
                from: self.ip,
            });
        }
        Ok(())
    }

    fn incoming(&self) -> Receiver<Datagram> {
        self.rx.clone()
    }

    fn shutdown(&mut self) {
        self.hub.lock().expect("hub lock").members.remove(&self.ip);
    }
}
