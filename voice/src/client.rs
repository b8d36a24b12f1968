//! Reliable stream client
//!
//! Connects to the voice server over a [`ReliableConnection`] and gates all
//! audio on the readiness handshake: after dialing, a Ping is sent and the
//! connect call blocks until the Pong arrives or the readiness timeout
//! elapses. A connection that fails the probe is closed and reported; it is
//! never used silently.
//!
//! When a ready stream drops abruptly, the disconnect callback re-dials the
//! server once, re-runs the handshake and announces the last Join again. A
//! graceful close by the server is final, as is a loss before the first
//! handshake completed.

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tracing::Span;
use voice_io::{
    CancellationToken, ConnectionError, ConnectionHandler, ConnectionStats, ReliableConnection,
};
use voice_protocol::{
    AudioPacket, ConnectionInfo, ConnectionState, HandshakeError, JoinPacket, Packet,
    ReadinessProbe, READINESS_TIMEOUT,
};

use crate::transport::Transport;

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Cannot resolve server address {info}: {source}")]
    Resolve {
        info: ConnectionInfo,
        #[source]
        source: io::Error,
    },

    #[error("Client is not ready")]
    NotReady,
}

/// Notifications from the client's receive thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Audio relayed over the stream
    Audio(AudioPacket),
    /// The stream ended; `graceful` is false for an abrupt loss
    Disconnected { graceful: bool },
    /// Automatic reconnect and handshake succeeded
    Reconnected { local_port: u16 },
    /// Automatic reconnect failed; the client stays disconnected
    ReconnectFailed(String),
    /// The server sent a packet type outside the protocol; the connection was closed
    ProtocolViolation(String),
}

struct ClientShared {
    connection: ReliableConnection,
    probe: ReadinessProbe,
    /// Last Join sent, replayed after a reconnect
    announce: Mutex<Option<JoinPacket>>,
    events: Sender<ClientEvent>,
    span: Span,
}

impl ClientShared {
    /// Send Ping and wait for the Pong
    fn verify_readiness(&self) -> Result<(), ClientError> {
        self.probe.begin_probe()?;

        let cancel = CancellationToken::new();
        let ping = Packet::Ping.to_bytes().freeze();
        let pending = self.connection.send_async(ping, cancel.clone());

        let result = self.probe.wait_ready();
        cancel.cancel();
        if let Err(e) = pending.wait() {
            tracing::debug!("Readiness ping not sent: {}", e);
        }

        match result {
            Ok(()) => {
                tracing::debug!("Readiness probe answered");
                Ok(())
            }
            Err(e @ HandshakeError::ReadinessTimeout(_)) => {
                tracing::warn!("Client failed readiness probe, aborting: {}", e);
                self.connection.close();
                Err(e.into())
            }
            Err(e) => {
                tracing::warn!("Readiness probe interrupted: {}", e);
                self.connection.close();
                self.probe.mark_disconnected();
                Err(e.into())
            }
        }
    }

    fn reconnect(&self) -> Result<u16, ClientError> {
        self.probe.begin_connect()?;
        let port = match self.connection.reconnect() {
            Ok(port) => port,
            Err(e) => {
                self.probe.mark_disconnected();
                return Err(e.into());
            }
        };
        self.verify_readiness()?;

        let announce = self.announce.lock().clone();
        if let Some(join) = announce {
            if let Err(e) = self.connection.send(&Packet::Join(join).to_bytes()) {
                self.connection.close();
                self.probe.mark_disconnected();
                return Err(e.into());
            }
            tracing::debug!("Join re-sent after reconnect");
        }
        Ok(port)
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

struct ClientHandler {
    shared: Weak<ClientShared>,
}

impl ConnectionHandler for ClientHandler {
    fn on_message(&self, connection: &ReliableConnection, frame: Bytes) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };

        match Packet::from_bytes(&frame) {
            Ok(Packet::Pong) => {
                shared.probe.accept_pong();
            }
            Ok(Packet::Audio(packet)) => {
                tracing::trace!("Audio from {} over stream", packet.player_id());
                shared.emit(ClientEvent::Audio(packet));
            }
            Ok(Packet::Ping) => {
                if let Err(e) = connection.send(&Packet::Pong.to_bytes()) {
                    tracing::debug!("Failed to answer Ping: {}", e);
                }
            }
            Ok(other) => {
                tracing::debug!("Ignoring {} packet from server", other.packet_type());
            }
            Err(e) if e.is_unknown_type() => {
                tracing::error!("Protocol violation from server, closing connection: {}", e);
                connection.close();
                shared.probe.mark_disconnected();
                shared.emit(ClientEvent::ProtocolViolation(e.to_string()));
            }
            Err(e) => {
                tracing::warn!("Malformed packet from server: {}", e);
            }
        }
    }

    fn on_disconnected(&self, _connection: &ReliableConnection, graceful: bool) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };

        let was_ready = shared.probe.is_ready();
        shared.probe.mark_disconnected();
        tracing::info!("Connection with TCP server was closed");
        shared.emit(ClientEvent::Disconnected { graceful });
        if graceful {
            return;
        }
        if !was_ready {
            // Loss during a handshake is reported by whoever is waiting on it
            tracing::debug!("Stream lost before readiness, not reconnecting");
            return;
        }

        tracing::info!("Attempting reconnect to TCP server");
        match shared.reconnect() {
            Ok(local_port) => {
                tracing::info!("Successfully reconnected to TCP server");
                shared.emit(ClientEvent::Reconnected { local_port });
            }
            Err(e) => {
                tracing::warn!("Unable to reconnect to TCP server: {}", e);
                shared.emit(ClientEvent::ReconnectFailed(e.to_string()));
            }
        }
    }
}

/// Reliable stream client
pub struct ReliableClient {
    shared: Arc<ClientShared>,
    events: Option<Receiver<ClientEvent>>,
    server: Option<ConnectionInfo>,
}

impl ReliableClient {
    /// Create a client with the default readiness timeout
    pub fn new(span: Span) -> Self {
        Self::with_readiness_timeout(READINESS_TIMEOUT, span)
    }

    pub fn with_readiness_timeout(timeout: Duration, span: Span) -> Self {
        let (events_tx, events) = channel::unbounded();
        let shared = Arc::new(ClientShared {
            connection: ReliableConnection::new(span.clone()),
            probe: ReadinessProbe::new(timeout),
            announce: Mutex::new(None),
            events: events_tx,
            span,
        });
        shared.connection.set_handler(Arc::new(ClientHandler {
            shared: Arc::downgrade(&shared),
        }));

        ReliableClient {
            shared,
            events: Some(events),
            server: None,
        }
    }

    /// Connect to the server and complete the readiness handshake
    ///
    /// Returns the local endpoint of the stream.
    pub fn connect(&mut self, server: &ConnectionInfo) -> Result<ConnectionInfo, ClientError> {
        let _enter = self.shared.span.enter();

        let endpoint = server.resolve().map_err(|source| ClientError::Resolve {
            info: server.clone(),
            source,
        })?;
        self.server = Some(server.clone());

        self.shared.probe.begin_connect()?;
        if let Err(e) = self.shared.connection.connect(endpoint) {
            self.shared.probe.mark_disconnected();
            return Err(e.into());
        }
        self.shared.verify_readiness()?;

        let local = self
            .shared
            .connection
            .local_addr()
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
        tracing::info!("Connected to TCP server {}", server);
        Ok(ConnectionInfo::from(local))
    }

    /// Send one audio frame to the server
    ///
    /// Returns `Ok(false)` without sending when the handshake has not
    /// completed.
    pub fn send_audio_to_server(&self, packet: &AudioPacket) -> Result<bool, ClientError> {
        if !self.shared.probe.is_ready() {
            let _enter = self.shared.span.enter();
            tracing::warn!("Attempting to send audio over TCP while client isn't ready, skipping");
            return Ok(false);
        }
        let packet = Packet::Audio(packet.clone());
        self.shared.connection.send(&packet.to_bytes())?;
        Ok(true)
    }

    /// Announce the datagram endpoint this player receives audio on
    ///
    /// The announcement is repeated automatically after a reconnect.
    pub fn send_join(&self, join: JoinPacket) -> Result<(), ClientError> {
        if !self.shared.probe.is_ready() {
            return Err(ClientError::NotReady);
        }
        self.shared.connection.send(&Packet::Join(join.clone()).to_bytes())?;
        *self.shared.announce.lock() = Some(join);
        Ok(())
    }

    /// Take the event channel (single consumer)
    pub fn take_events(&mut self) -> Option<Receiver<ClientEvent>> {
        self.events.take()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.probe.state()
    }

    pub fn is_ready(&self) -> bool {
        self.shared.probe.is_ready()
    }

    /// Number of completed handshakes (initial connect plus reconnects)
    pub fn handshakes(&self) -> u64 {
        self.shared.probe.ready_transitions()
    }

    /// Server the client was last asked to connect to
    pub fn server(&self) -> Option<&ConnectionInfo> {
        self.server.as_ref()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.shared.connection.stats()
    }
}

impl Transport for ReliableClient {
    fn transport_id(&self) -> &'static str {
        "TCP"
    }

    fn local_port(&self) -> u16 {
        self.shared.connection.local_port()
    }

    fn shutdown(&mut self) {
        self.shared.connection.dispose();
        self.shared.probe.mark_disconnected();
    }
}

impl Drop for ReliableClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}
