//! Datagram transport: the seam between the gossip engine and the network.
//!
//! Production uses a single UDP endpoint on the well-known port with
//! broadcast enabled. Tests swap in an in-process hub (`crate::testkit`)
//! behind the same trait.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender};
use thiserror::Error;

use crate::error::Transience;

/// The well-known gossip port.
pub const DEFAULT_PORT: u16 = 43210;

const RECV_BUF_BYTES: usize = 64 * 1024;
const READER_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("udp bind failed on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("send to {dest} failed: {source}")]
    Send {
        dest: String,
        #[source]
        source: io::Error,
    },
}

impl TransportError {
    pub fn transience(&self) -> Transience {
        match self {
            TransportError::Bind { .. } => Transience::Permanent,
            TransportError::Send { .. } => Transience::Retryable,
        }
    }
}

/// One inbound datagram with its sender address.
#[derive(Clone, Debug)]
pub struct Datagram {
    pub bytes: Vec<u8>,
    pub from: IpAddr,
}

/// Send/receive seam used by the gossip engine.
///
/// Inbound datagrams are delivered on the `incoming` channel by whatever
/// machinery the implementation runs (a reader thread for UDP, the hub for
/// tests); the engine selects on it directly, no broker in between.
pub trait Transport: Send {
    fn send_broadcast(&mut self, payload: &[u8]) -> Result<(), TransportError>;
    fn send_unicast(&mut self, payload: &[u8], to: IpAddr) -> Result<(), TransportError>;
    fn incoming(&self) -> Receiver<Datagram>;
    fn shutdown(&mut self) {}
}

/// Production transport: one UDP socket, broadcast + unicast, a blocking
/// reader thread feeding the inbound channel.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    port: u16,
    broadcast_dest: SocketAddrV4,
    rx: Receiver<Datagram>,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl UdpTransport {
    /// Bind `0.0.0.0:{port}` and start the reader thread.
    ///
    /// `broadcast_addr` overrides the destination for broadcast sends;
    /// without it the limited broadcast address is used. If the environment
    /// refuses SO_BROADCAST the engine falls back to per-peer unicast, so
    /// the failure is only logged here.
    pub fn bind(port: u16, broadcast_addr: Option<Ipv4Addr>) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))
            .map_err(|source| TransportError::Bind { port, source })?;
        if let Err(e) = socket.set_broadcast(true) {
            tracing::warn!("broadcast not permitted on socket: {e}");
        }
        socket
            .set_read_timeout(Some(READER_POLL))
            .map_err(|source| TransportError::Bind { port, source })?;

        let socket = Arc::new(socket);
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = crossbeam::channel::unbounded();
        let reader = spawn_reader(Arc::clone(&socket), Arc::clone(&stop), tx);

        let dest = broadcast_addr.unwrap_or(Ipv4Addr::BROADCAST);
        tracing::info!(port, broadcast = %dest, "udp transport bound");
        Ok(Self {
            socket,
            port,
            broadcast_dest: SocketAddrV4::new(dest, port),
            rx,
            stop,
            reader: Some(reader),
        })
    }
}

fn spawn_reader(
    socket: Arc<UdpSocket>,
    stop: Arc<AtomicBool>,
    tx: Sender<Datagram>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("gatemesh-udp-rx".into())
        .spawn(move || {
            let mut buf = vec![0u8; RECV_BUF_BYTES];
            while !stop.load(Ordering::Relaxed) {
                match socket.recv_from(&mut buf) {
                    Ok((len, from)) => {
                        let datagram = Datagram {
                            bytes: buf[..len].to_vec(),
                            from: from.ip(),
                        };
                        if tx.send(datagram).is_err() {
                            break;
                        }
                    }
                    Err(e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::TimedOut => {}
                    Err(e) => {
                        if stop.load(Ordering::Relaxed) {
                            break;
                        }
                        tracing::warn!("udp receive failed: {e}");
                    }
                }
            }
        })
        .expect("spawn udp reader thread")
}

impl Transport for UdpTransport {
    fn send_broadcast(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        self.socket
            .send_to(payload, self.broadcast_dest)
            .map_err(|source| TransportError::Send {
                dest: self.broadcast_dest.to_string(),
                source,
            })?;
        Ok(())
    }

    fn send_unicast(&mut self, payload: &[u8], to: IpAddr) -> Result<(), TransportError> {
        let dest = SocketAddr::new(to, self.port);
        self.socket
            .send_to(payload, dest)
            .map_err(|source| TransportError::Send {
                dest: dest.to_string(),
                source,
            })?;
        Ok(())
    }

    fn incoming(&self) -> Receiver<Datagram> {
        self.rx.clone()
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}
