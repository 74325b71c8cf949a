//! The gossip engine: the core object and its public surface.
//!
//! One state thread owns every mutable structure (replica, peer table,
//! pending table, dedup cache, store, transport). The transport's reader
//! feeds it datagrams over a channel, callers reach it through commands
//! carrying reply channels, and the five timers share one scheduler, so
//! shutdown is a single loop exit.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam::channel::{Receiver, Sender, bounded, unbounded};
use serde::Serialize;
use thiserror::Error;

pub mod admission;
mod scheduler;
mod state;

pub use admission::{DenyReason, ScanOutcome};

use crate::config::Config;
use crate::core::{IdSource, PassSnapshot, ReplicaView, UuidIds, WallClockSource, system_clock};
use crate::error::Transience;
use crate::net::{Datagram, Transport, UdpTransport};
use crate::store::Store;
use scheduler::Timers;
use state::EngineState;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    #[error("engine is not running")]
    Stopped,

    #[error("state thread spawn failed: {source}")]
    Spawn {
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    pub fn transience(&self) -> Transience {
        Transience::Permanent
    }
}

/// Snapshot of the engine's operational health.
#[derive(Clone, Debug, Serialize)]
pub struct Health {
    /// Peers heard from within the liveness window.
    pub peers_connected: usize,
    /// Seconds since the replica last agreed with or absorbed remote state.
    pub time_since_last_sync_s: Option<u64>,
    /// Depth of the persistent broadcast retry queue.
    pub pending_broadcasts: u64,
    /// Un-ACKed delta sends currently tracked.
    pub pending_acks: usize,
}

enum Command {
    Submit {
        code: String,
        reply: Sender<ScanOutcome>,
    },
    QueryState {
        reply: Sender<ReplicaView>,
    },
    QueryConfig {
        reply: Sender<PassSnapshot>,
    },
    QueryHealth {
        reply: Sender<Health>,
    },
    Rescan {
        reply: Sender<()>,
    },
    Shutdown {
        reply: Sender<()>,
    },
}

/// Handle to a running engine. Cloneless by design: the shell owns it and
/// calls in from wherever it likes; every call serializes through the state
/// thread.
pub struct Engine {
    cmd_tx: Sender<Command>,
    thread: Option<JoinHandle<()>>,
}

impl Engine {
    /// Open the store, load state, bind the UDP transport on the well-known
    /// port, start the state thread, and announce ourselves with a state
    /// request. Failures here are the only fatal ones; the host decides
    /// whether to retry or run degraded.
    pub fn init(config: &Config) -> crate::Result<Self> {
        let transport = UdpTransport::bind(config.net.port, config.net.broadcast_addr)?;
        Self::init_with(config, Box::new(transport), system_clock(), Arc::new(UuidIds))
    }

    /// `init` with the transport, clock and id source injected. The test
    /// suite and fleet simulations run entirely through this.
    pub fn init_with(
        config: &Config,
        transport: Box<dyn Transport>,
        clock: Arc<dyn WallClockSource>,
        ids: Arc<dyn IdSource>,
    ) -> crate::Result<Self> {
        let data_dir = config
            .data_dir
            .clone()
            .unwrap_or_else(crate::paths::data_dir);
        let store = Store::open(&crate::paths::store_path(&data_dir))?;
        let net_rx = transport.incoming();
        let mut state = EngineState::boot(config, store, transport, clock, ids)?;

        // Pull the fleet toward us immediately instead of waiting a tick.
        state.broadcast_state_request();

        let timers = Timers::new(&config.timers, Instant::now());
        let (cmd_tx, cmd_rx) = unbounded();
        let thread = std::thread::Builder::new()
            .name("gatemesh-state".into())
            .spawn(move || run_state_loop(state, cmd_rx, net_rx, timers))
            .map_err(|source| EngineError::Spawn { source })?;

        Ok(Self {
            cmd_tx,
            thread: Some(thread),
        })
    }

    /// Admission + local append + dissemination for one candidate code.
    pub fn submit_scan(&self, code: &str) -> crate::Result<ScanOutcome> {
        let code = code.to_string();
        self.request(|reply| Command::Submit { code, reply })
    }

    /// Consistent snapshot of the merged replica.
    pub fn query_state(&self) -> crate::Result<ReplicaView> {
        self.request(|reply| Command::QueryState { reply })
    }

    /// The installed pass snapshot.
    pub fn query_config(&self) -> crate::Result<PassSnapshot> {
        self.request(|reply| Command::QueryConfig { reply })
    }

    pub fn query_health(&self) -> crate::Result<Health> {
        self.request(|reply| Command::QueryHealth { reply })
    }

    /// Broadcast a state request, e.g. from a "rescan" button.
    pub fn rescan_peers(&self) -> crate::Result<()> {
        self.request(|reply| Command::Rescan { reply })
    }

    /// Stop the timers, close the socket and join the state thread. Pending
    /// ACKs are in-memory only; a restart re-learns from peers.
    pub fn shutdown(mut self) -> crate::Result<()> {
        let outcome = self.request(|reply| Command::Shutdown { reply });
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        outcome
    }

    fn request<T>(&self, make: impl FnOnce(Sender<T>) -> Command) -> crate::Result<T> {
        let (tx, rx) = bounded(1);
        self.cmd_tx
            .send(make(tx))
            .map_err(|_| crate::Error::from(EngineError::Stopped))?;
        rx.recv()
            .map_err(|_| crate::Error::from(EngineError::Stopped))
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let (reply, _rx) = bounded(1);
            let _ = self.cmd_tx.send(Command::Shutdown { reply });
            let _ = thread.join();
        }
    }
}

fn run_state_loop(
    mut state: EngineState,
    cmd_rx: Receiver<Command>,
    net_rx: Receiver<Datagram>,
    mut timers: Timers,
) {
    loop {
        let timeout = timers.until_next(Instant::now());
        let mut stop = false;
        crossbeam::select! {
            recv(cmd_rx) -> msg => match msg {
                Ok(command) => stop = handle_command(&mut state, command),
                Err(_) => stop = true,
            },
            recv(net_rx) -> datagram => {
                if let Ok(datagram) = datagram {
                    state.handle_datagram(datagram);
                }
            },
            default(timeout) => {},
        }
        for kind in timers.due(Instant::now()) {
            state.on_timer(kind);
        }
        if stop {
            break;
        }
    }
    state.shutdown();
}

/// Returns true on shutdown.
fn handle_command(state: &mut EngineState, command: Command) -> bool {
    match command {
        Command::Submit { code, reply } => {
            let _ = reply.send(state.submit_scan(&code));
            false
        }
        Command::QueryState { reply } => {
            let _ = reply.send(state.view());
            false
        }
        Command::QueryConfig { reply } => {
            let _ = reply.send(state.config_snapshot());
            false
        }
        Command::QueryHealth { reply } => {
            let _ = reply.send(state.health());
            false
        }
        Command::Rescan { reply } => {
            state.broadcast_state_request();
            let _ = reply.send(());
            false
        }
        Command::Shutdown { reply } => {
            let _ = reply.send(());
            true
        }
    }
}
