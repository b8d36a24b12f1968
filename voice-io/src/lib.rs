//! Voice I/O and Platform Abstraction
//!
//! This crate provides the packet-agnostic network plumbing used by both voice
//! transports: a UDP socket wrapper, a length-framed reliable stream
//! connection with its own receive thread, cancellation tokens, timers, and
//! address helpers for deciding whether external port mapping is needed.

pub mod cancel;
pub mod netaddr;
pub mod socket;
pub mod stream;
pub mod time;

pub use cancel::CancellationToken;
pub use netaddr::{
    canonical_ip, is_internal_network, local_ipv4, LocalAddressResolver, MappingProtocol,
    NetAddrError, PortMapper, PublicAddressResolver,
};
pub use socket::{SocketError, VoiceSocket};
pub use stream::{
    ConnectionError, ConnectionHandler, ConnectionStats, PendingSend, ReliableConnection,
};
pub use time::{FramePacer, Timer};
