//! Datagram server
//!
//! Relays audio to registered players by datagram. The registry of
//! `player_id -> ConnectionInfo` is owned by the server and only mutated
//! through `&mut self`; the receive loop never touches it.

use crate::dispatch::{self, DatagramCounters, DatagramStats, ReceivedAudio, RECV_POLL_INTERVAL};
use crate::transport::Transport;
use crossbeam::channel::{self, Receiver, Sender};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::Span;
use voice_io::{
    canonical_ip, is_internal_network, LocalAddressResolver, MappingProtocol, NetAddrError,
    PortMapper, PublicAddressResolver, SocketError, VoiceSocket,
};
use voice_protocol::{ConnectionInfo, Packet};

/// Statistics reported by [`DatagramServer::stats`]
pub type ServerStats = DatagramStats;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Player {0} is not connected to the server")]
    UnknownPeer(String),

    #[error("Player {0} is already registered")]
    DuplicatePlayer(String),

    #[error("Server has not been launched")]
    NotLaunched,

    #[error("Server is already running")]
    AlreadyLaunched,

    #[error("Failed to resolve server address: {0}")]
    Address(#[from] NetAddrError),

    #[error("Cannot resolve endpoint {info}: {source}")]
    Resolve {
        info: ConnectionInfo,
        #[source]
        source: io::Error,
    },

    #[error("Socket error: {0}")]
    Socket(#[from] SocketError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Local address to bind
    pub bind_ip: IpAddr,
    /// Port to bind; 0 picks an ephemeral port
    pub port: u16,
    /// Address advertised to players; discovered at launch when unset
    pub public_ip: Option<IpAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            public_ip: None,
        }
    }
}

/// Datagram server
pub struct DatagramServer {
    config: ServerConfig,
    resolver: Box<dyn PublicAddressResolver>,
    port_mapper: Option<Box<dyn PortMapper>>,
    mapped_port: Option<u16>,
    registry: HashMap<String, ConnectionInfo>,
    socket: Option<VoiceSocket>,
    connection_info: Option<ConnectionInfo>,
    running: Arc<AtomicBool>,
    recv_thread: Option<JoinHandle<()>>,
    events_tx: Sender<ReceivedAudio>,
    events: Option<Receiver<ReceivedAudio>>,
    counters: Arc<DatagramCounters>,
    span: Span,
}

impl DatagramServer {
    pub fn new(config: ServerConfig, span: Span) -> Self {
        let (events_tx, events) = channel::unbounded();
        DatagramServer {
            config,
            resolver: Box::new(LocalAddressResolver),
            port_mapper: None,
            mapped_port: None,
            registry: HashMap::new(),
            socket: None,
            connection_info: None,
            running: Arc::new(AtomicBool::new(false)),
            recv_thread: None,
            events_tx,
            events: Some(events),
            counters: Arc::new(DatagramCounters::default()),
            span,
        }
    }

    /// Use `resolver` to discover the advertised address
    pub fn with_resolver(mut self, resolver: Box<dyn PublicAddressResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Use `mapper` to forward the port when the advertised address is public
    pub fn with_port_mapper(mut self, mapper: Box<dyn PortMapper>) -> Self {
        self.port_mapper = Some(mapper);
        self
    }

    /// Resolve the advertised address, open the socket, and start receiving
    ///
    /// External port mapping is attempted only when the advertised address is
    /// outside private networks; a mapping failure is logged and launch
    /// continues.
    pub fn launch(&mut self) -> Result<(), ServerError> {
        if self.socket.is_some() {
            return Err(ServerError::AlreadyLaunched);
        }
        let span = self.span.clone();
        let _enter = span.enter();

        let ip = match self.config.public_ip {
            Some(ip) => ip,
            None => self.resolver.public_ip()?,
        };
        let ip = canonical_ip(ip);

        let socket = VoiceSocket::bind(SocketAddr::new(self.config.bind_ip, self.config.port))?;
        socket.set_read_timeout(Some(RECV_POLL_INTERVAL))?;
        let port = socket.local_addr()?.port();

        if !is_internal_network(ip) {
            self.map_port(port);
        } else {
            tracing::debug!("{} is on a private network, skipping port mapping", ip);
        }

        self.running.store(true, Ordering::Release);
        let handle = dispatch::spawn_receive_loop(
            "voice-udp-server",
            socket.try_clone()?,
            self.events_tx.clone(),
            self.counters.clone(),
            self.running.clone(),
            self.span.clone(),
        );
        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                self.running.store(false, Ordering::Release);
                self.unmap_port();
                return Err(e.into());
            }
        };

        self.recv_thread = Some(handle);
        self.socket = Some(socket);
        self.connection_info = Some(ConnectionInfo::from(SocketAddr::new(ip, port)));
        tracing::info!("UDP server listening on port {} (advertised as {})", port, ip);
        Ok(())
    }

    /// Endpoint players should send datagrams to
    pub fn get_connection(&self) -> Result<ConnectionInfo, ServerError> {
        self.connection_info.clone().ok_or(ServerError::NotLaunched)
    }

    /// Send `packet` to a registered player
    ///
    /// Fails with [`ServerError::UnknownPeer`] if `player_id` is not
    /// registered; the registry and receive loop are unaffected.
    pub fn send_packet(&self, packet: &Packet, player_id: &str) -> Result<(), ServerError> {
        let Some(info) = self.registry.get(player_id) else {
            self.counters
                .unknown_peer_sends
                .fetch_add(1, Ordering::Relaxed);
            return Err(ServerError::UnknownPeer(player_id.to_string()));
        };
        let socket = self.socket.as_ref().ok_or(ServerError::NotLaunched)?;
        let destination = info.resolve().map_err(|source| ServerError::Resolve {
            info: info.clone(),
            source,
        })?;

        socket.send_to(&packet.to_bytes(), destination)?;
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Register the datagram endpoint of `player_id`
    pub fn player_connected(
        &mut self,
        player_id: impl Into<String>,
        info: ConnectionInfo,
    ) -> Result<(), ServerError> {
        let player_id = player_id.into();
        match self.registry.entry(player_id) {
            Entry::Occupied(entry) => Err(ServerError::DuplicatePlayer(entry.key().clone())),
            Entry::Vacant(entry) => {
                let _enter = self.span.enter();
                tracing::debug!("{} connected over UDP at {}", entry.key(), info);
                entry.insert(info);
                Ok(())
            }
        }
    }

    /// Remove `player_id` from the registry
    pub fn player_disconnected(&mut self, player_id: &str) -> Option<ConnectionInfo> {
        let removed = self.registry.remove(player_id);
        if removed.is_some() {
            let _enter = self.span.enter();
            tracing::debug!("{} disconnected from UDP server", player_id);
        }
        removed
    }

    /// Check if `player_id` is registered
    pub fn is_registered(&self, player_id: &str) -> bool {
        self.registry.contains_key(player_id)
    }

    /// Registered player ids
    pub fn players(&self) -> impl Iterator<Item = &str> {
        self.registry.keys().map(String::as_str)
    }

    /// Take the channel of received audio (single consumer)
    pub fn take_events(&mut self) -> Option<Receiver<ReceivedAudio>> {
        self.events.take()
    }

    /// Check if the receive loop is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ServerStats {
        self.counters.snapshot()
    }

    fn map_port(&mut self, port: u16) {
        let Some(mapper) = self.port_mapper.as_mut() else {
            tracing::warn!("Public address without a port mapper; port {} may be unreachable", port);
            return;
        };
        match mapper.map_port(port, MappingProtocol::Udp) {
            Ok(()) => {
                tracing::info!("Mapped external UDP port {}", port);
                self.mapped_port = Some(port);
            }
            Err(e) => tracing::warn!("Port mapping for {} failed: {}", port, e),
        }
    }

    fn unmap_port(&mut self) {
        let Some(port) = self.mapped_port.take() else {
            return;
        };
        if let Some(mapper) = self.port_mapper.as_mut() {
            if let Err(e) = mapper.unmap_port(port, MappingProtocol::Udp) {
                tracing::debug!("Failed to remove port mapping for {}: {}", port, e);
            }
        }
    }
}

impl Transport for DatagramServer {
    fn transport_id(&self) -> &'static str {
        "UDP"
    }

    fn local_port(&self) -> u16 {
        self.connection_info.as_ref().map_or(0, ConnectionInfo::port)
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.recv_thread.take() {
            let _ = handle.join();
        }
        self.unmap_port();
        if self.socket.take().is_some() {
            let _enter = self.span.enter();
            tracing::info!("UDP server stopped");
        }
    }
}

impl Drop for DatagramServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
