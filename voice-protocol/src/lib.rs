//! Voice Protocol Core Implementation
//!
//! This crate implements the wire format shared by the reliable stream and
//! datagram transports, the per-connection state machine, and the readiness
//! handshake that gates whether a connection may carry audio.

pub mod connection;
pub mod handshake;
pub mod packet;

pub use connection::ConnectionState;
pub use handshake::{HandshakeError, ReadinessProbe, READINESS_TIMEOUT};
pub use packet::{
    AudioFormat, AudioPacket, ConnectionInfo, JoinPacket, Packet, PacketError, PacketType,
};
