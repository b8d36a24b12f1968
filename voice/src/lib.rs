//! Voice - proximity voice chat transport
//!
//! High-level API over the voice transports: a reliable stream client with
//! readiness handshake and automatic reconnect, the matching stream listener,
//! and the datagram server and receiver used for audio relay.

pub use voice_io as io;
pub use voice_playback as playback;
pub use voice_protocol as protocol;

pub mod client;
mod dispatch;
pub mod listener;
pub mod receiver;
pub mod server;
pub mod transport;

pub use client::{ClientError, ClientEvent, ReliableClient};
pub use dispatch::{DatagramStats, ReceivedAudio};
pub use listener::{ListenerError, ListenerEvent, ReliableListener};
pub use receiver::{DatagramReceiver, ReceiverError};
pub use server::{DatagramServer, ServerConfig, ServerError, ServerStats};
pub use transport::Transport;

// Re-export commonly used types
pub use protocol::{AudioPacket, ConnectionInfo, ConnectionState, JoinPacket, Packet, PacketType};
