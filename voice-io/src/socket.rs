//! UDP socket wrapper for the datagram transport
//!
//! Sockets are configured through socket2 and then used through the standard
//! library socket with a read timeout, so receive loops can observe shutdown
//! requests without spinning.

use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use thiserror::Error;

/// Largest datagram the receive loops accept
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Socket configuration errors
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Datagram socket
pub struct VoiceSocket {
    inner: UdpSocket,
}

impl VoiceSocket {
    /// Create a new socket bound to the given address
    pub fn bind(addr: SocketAddr) -> Result<Self, SocketError> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;

        Ok(VoiceSocket {
            inner: socket.into(),
        })
    }

    /// Bound how long [`recv_from`](Self::recv_from) blocks
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), SocketError> {
        self.inner.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Set the receive buffer size
    pub fn set_recv_buffer_size(&self, size: usize) -> Result<(), SocketError> {
        socket2::SockRef::from(&self.inner).set_recv_buffer_size(size)?;
        Ok(())
    }

    /// Get the receive buffer size
    pub fn recv_buffer_size(&self) -> Result<usize, SocketError> {
        Ok(socket2::SockRef::from(&self.inner).recv_buffer_size()?)
    }

    /// Get the local address this socket is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        Ok(self.inner.local_addr()?)
    }

    /// Send one datagram to the given address
    pub fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize, SocketError> {
        Ok(self.inner.send_to(buf, target)?)
    }

    /// Receive one datagram
    ///
    /// Returns `Ok(None)` when the read timeout elapsed without data.
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, SocketError> {
        match self.inner.recv_from(buf) {
            Ok(result) => Ok(Some(result)),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            // Windows reports ICMP port-unreachable from an earlier send as a reset
            Err(e) if e.kind() == ErrorKind::ConnectionReset => Ok(None),
            Err(e) => Err(SocketError::Io(e)),
        }
    }

    /// Try to clone the socket
    pub fn try_clone(&self) -> Result<Self, SocketError> {
        Ok(VoiceSocket {
            inner: self.inner.try_clone()?,
        })
    }
}
