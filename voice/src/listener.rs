//! Reliable stream listener
//!
//! Server side of the stream transport. Every accepted peer gets its own
//! [`ReliableConnection`] and receive thread. Ping is answered with Pong on
//! the receive thread; Join and Audio are forwarded to a single-consumer
//! event channel tagged with the peer address. Packets of an unknown type are
//! logged and dropped without closing the peer. Server-side connections never
//! reconnect.

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::Span;
use voice_io::{ConnectionError, ConnectionHandler, ReliableConnection};
use voice_protocol::{AudioPacket, JoinPacket, Packet};

use crate::transport::Transport;

/// How often the accept loop checks for shutdown
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Listen backlog
const BACKLOG: i32 = 128;

/// Listener errors
#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Peer {0} is not connected")]
    UnknownPeer(SocketAddr),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Notifications from peer receive threads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    Join { peer: SocketAddr, join: JoinPacket },
    Audio { peer: SocketAddr, packet: AudioPacket },
    PeerDisconnected { peer: SocketAddr, graceful: bool },
}

struct ListenerShared {
    peers: Mutex<HashMap<SocketAddr, ReliableConnection>>,
    events: Sender<ListenerEvent>,
    running: AtomicBool,
    span: Span,
}

impl ListenerShared {
    fn emit(&self, event: ListenerEvent) {
        let _ = self.events.send(event);
    }

    fn accept_peer(self: &Arc<Self>, stream: std::net::TcpStream, peer: SocketAddr) {
        let span = tracing::info_span!(parent: &self.span, "peer", %peer);
        let connection = match stream
            .set_nonblocking(false)
            .map_err(ConnectionError::from)
            .and_then(|_| ReliableConnection::from_stream(stream, span))
        {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!("Failed to set up connection from {}: {}", peer, e);
                return;
            }
        };

        connection.set_handler(Arc::new(PeerHandler {
            shared: Arc::downgrade(self),
            peer,
        }));
        self.peers.lock().insert(peer, connection.clone());

        if let Err(e) = connection.start_listening() {
            tracing::warn!("Failed to start receiving from {}: {}", peer, e);
            self.peers.lock().remove(&peer);
            connection.dispose();
            return;
        }
        tracing::info!("Accepted TCP connection from {}", peer);
    }
}

struct PeerHandler {
    shared: Weak<ListenerShared>,
    peer: SocketAddr,
}

impl ConnectionHandler for PeerHandler {
    fn on_message(&self, connection: &ReliableConnection, frame: Bytes) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let peer = self.peer;

        match Packet::from_bytes(&frame) {
            Ok(Packet::Ping) => {
                tracing::trace!("Ping from {}", peer);
                if let Err(e) = connection.send(&Packet::Pong.to_bytes()) {
                    tracing::debug!("Failed to answer Ping from {}: {}", peer, e);
                }
            }
            Ok(Packet::Pong) => {
                tracing::trace!("Unsolicited Pong from {}", peer);
            }
            Ok(Packet::Join(join)) => {
                tracing::debug!("{} joined from {}", join.player_id(), peer);
                shared.emit(ListenerEvent::Join { peer, join });
            }
            Ok(Packet::Audio(packet)) => {
                shared.emit(ListenerEvent::Audio { peer, packet });
            }
            Err(e) if e.is_unknown_type() => {
                tracing::error!("Unsupported packet from {}, dropping: {}", peer, e);
            }
            Err(e) => {
                tracing::warn!("Malformed packet from {}: {}", peer, e);
            }
        }
    }

    fn on_disconnected(&self, connection: &ReliableConnection, graceful: bool) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };

        shared.peers.lock().remove(&self.peer);
        connection.dispose();
        tracing::info!("Peer {} disconnected (graceful: {})", self.peer, graceful);
        shared.emit(ListenerEvent::PeerDisconnected {
            peer: self.peer,
            graceful,
        });
    }
}

/// Reliable stream listener
pub struct ReliableListener {
    shared: Arc<ListenerShared>,
    local_addr: SocketAddr,
    accept_thread: Option<JoinHandle<()>>,
    events: Option<Receiver<ListenerEvent>>,
}

impl ReliableListener {
    /// Bind `addr` and start accepting
    pub fn bind(addr: SocketAddr, span: Span) -> Result<Self, ListenerError> {
        let listener = open_listener(addr).map_err(|source| ListenerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let (events_tx, events) = channel::unbounded();
        let shared = Arc::new(ListenerShared {
            peers: Mutex::new(HashMap::new()),
            events: events_tx,
            running: AtomicBool::new(true),
            span,
        });

        let accept_shared = shared.clone();
        let accept_thread = thread::Builder::new()
            .name("voice-tcp-accept".to_string())
            .spawn(move || {
                let span = accept_shared.span.clone();
                let _entered = span.entered();
                accept_loop(&listener, &accept_shared);
            })?;

        {
            let _enter = shared.span.enter();
            tracing::info!("TCP listener on {}", local_addr);
        }

        Ok(ReliableListener {
            shared,
            local_addr,
            accept_thread: Some(accept_thread),
            events: Some(events),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send `packet` to a connected peer
    pub fn send_to(&self, peer: SocketAddr, packet: &Packet) -> Result<(), ListenerError> {
        let connection = self
            .shared
            .peers
            .lock()
            .get(&peer)
            .cloned()
            .ok_or(ListenerError::UnknownPeer(peer))?;
        connection.send(&packet.to_bytes())?;
        Ok(())
    }

    /// Close the stream to `peer`; the peer observes a graceful close
    pub fn disconnect(&self, peer: SocketAddr) -> bool {
        let connection = self.shared.peers.lock().remove(&peer);
        match connection {
            Some(connection) => {
                connection.dispose();
                true
            }
            None => false,
        }
    }

    /// Currently connected peers
    pub fn peers(&self) -> Vec<SocketAddr> {
        self.shared.peers.lock().keys().copied().collect()
    }

    /// Take the event channel (single consumer)
    pub fn take_events(&mut self) -> Option<Receiver<ListenerEvent>> {
        self.events.take()
    }
}

impl Transport for ReliableListener {
    fn transport_id(&self) -> &'static str {
        "TCP"
    }

    fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    fn shutdown(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }

        // Dispose outside the lock; a peer thread may be waiting on it
        let peers: Vec<ReliableConnection> =
            self.shared.peers.lock().drain().map(|(_, c)| c).collect();
        for connection in peers {
            connection.dispose();
        }
    }
}

impl Drop for ReliableListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn open_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn accept_loop(listener: &TcpListener, shared: &Arc<ListenerShared>) {
    while shared.running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => shared.accept_peer(stream, peer),
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL_INTERVAL),
            Err(e) => {
                tracing::warn!("Accept failed: {}", e);
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
    tracing::debug!("Accept loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use voice_protocol::ConnectionInfo;

    fn listener() -> (ReliableListener, Receiver<ListenerEvent>) {
        let mut listener = ReliableListener::bind("127.0.0.1:0".parse().unwrap(), Span::none()).unwrap();
        let events = listener.take_events().unwrap();
        (listener, events)
    }

    fn write_frame(stream: &mut TcpStream, payload: &[u8]) {
        stream.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
        stream.write_all(payload).unwrap();
    }

    fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).unwrap();
        let mut body = vec![0u8; u32::from_le_bytes(header) as usize];
        stream.read_exact(&mut body).unwrap();
        body
    }

    #[test]
    fn test_ping_is_answered() {
        let (listener, _events) = listener();
        let mut stream = TcpStream::connect(listener.local_addr()).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        write_frame(&mut stream, &Packet::Ping.to_bytes());
        assert_eq!(Packet::from_bytes(&read_frame(&mut stream)).unwrap(), Packet::Pong);
    }

    #[test]
    fn test_join_and_audio_forwarded() {
        let (listener, events) = listener();
        let mut stream = TcpStream::connect(listener.local_addr()).unwrap();
        let peer = stream.local_addr().unwrap();

        let join = JoinPacket::new("alice", ConnectionInfo::new("127.0.0.1", 5000).unwrap()).unwrap();
        write_frame(&mut stream, &Packet::Join(join.clone()).to_bytes());
        let audio = AudioPacket::from_samples("alice", &[1; 960]).unwrap();
        write_frame(&mut stream, &Packet::Audio(audio.clone()).to_bytes());

        let timeout = Duration::from_secs(2);
        assert_eq!(
            events.recv_timeout(timeout).unwrap(),
            ListenerEvent::Join { peer, join }
        );
        assert_eq!(
            events.recv_timeout(timeout).unwrap(),
            ListenerEvent::Audio { peer, packet: audio }
        );
    }

    #[test]
    fn test_unknown_type_does_not_close_peer() {
        let (listener, _events) = listener();
        let mut stream = TcpStream::connect(listener.local_addr()).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        write_frame(&mut stream, &77i32.to_le_bytes());
        write_frame(&mut stream, &Packet::Ping.to_bytes());
        assert_eq!(Packet::from_bytes(&read_frame(&mut stream)).unwrap(), Packet::Pong);
    }

    #[test]
    fn test_peer_disconnect_reported() {
        let (listener, events) = listener();
        let stream = TcpStream::connect(listener.local_addr()).unwrap();
        let peer = stream.local_addr().unwrap();
        drop(stream);

        assert_eq!(
            events.recv_timeout(Duration::from_secs(2)).unwrap(),
            ListenerEvent::PeerDisconnected {
                peer,
                graceful: true
            }
        );
        assert!(listener.peers().is_empty());
    }

    #[test]
    fn test_send_to_unknown_peer() {
        let (listener, _events) = listener();
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert!(matches!(
            listener.send_to(addr, &Packet::Pong),
            Err(ListenerError::UnknownPeer(_))
        ));
    }
}
