//! Datagram receiver
//!
//! Client side of the datagram transport: binds a local socket whose
//! endpoint is announced to the server with a Join packet, and collects the
//! audio the server relays to it.

use crate::dispatch::{self, DatagramCounters, DatagramStats, ReceivedAudio, RECV_POLL_INTERVAL};
use crate::transport::Transport;
use crossbeam::channel::{self, Receiver};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::Span;
use voice_io::{canonical_ip, SocketError, VoiceSocket};
use voice_protocol::{ConnectionInfo, Packet};

/// Receiver errors
#[derive(Error, Debug)]
pub enum ReceiverError {
    #[error("Socket error: {0}")]
    Socket(#[from] SocketError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Receiver has been shut down")]
    Closed,
}

/// Datagram receiver
pub struct DatagramReceiver {
    socket: Option<VoiceSocket>,
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    recv_thread: Option<JoinHandle<()>>,
    events: Option<Receiver<ReceivedAudio>>,
    counters: Arc<DatagramCounters>,
    span: Span,
}

impl DatagramReceiver {
    /// Bind `addr` and start receiving
    pub fn bind(addr: SocketAddr, span: Span) -> Result<Self, ReceiverError> {
        let socket = VoiceSocket::bind(addr)?;
        socket.set_read_timeout(Some(RECV_POLL_INTERVAL))?;
        let local_addr = socket.local_addr()?;

        let (events_tx, events) = channel::unbounded();
        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(DatagramCounters::default());
        let handle = dispatch::spawn_receive_loop(
            "voice-udp-client",
            socket.try_clone()?,
            events_tx,
            counters.clone(),
            running.clone(),
            span.clone(),
        )?;

        {
            let _enter = span.enter();
            tracing::info!("UDP receiver listening on {}", local_addr);
        }

        Ok(DatagramReceiver {
            socket: Some(socket),
            local_addr,
            running,
            recv_thread: Some(handle),
            events: Some(events),
            counters,
            span,
        })
    }

    /// Endpoint to announce to the server
    ///
    /// `advertised_ip` replaces an unspecified bind address.
    pub fn connection_info(&self, advertised_ip: Option<IpAddr>) -> ConnectionInfo {
        let ip = match advertised_ip {
            Some(ip) => ip,
            None => self.local_addr.ip(),
        };
        ConnectionInfo::from(SocketAddr::new(canonical_ip(ip), self.local_addr.port()))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send a packet from the receiving socket (keeps NAT bindings open)
    pub fn send_packet(&self, packet: &Packet, destination: SocketAddr) -> Result<(), ReceiverError> {
        let socket = self.socket.as_ref().ok_or(ReceiverError::Closed)?;
        socket.send_to(&packet.to_bytes(), destination)?;
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Take the channel of received audio (single consumer)
    pub fn take_events(&mut self) -> Option<Receiver<ReceivedAudio>> {
        self.events.take()
    }

    pub fn stats(&self) -> DatagramStats {
        self.counters.snapshot()
    }
}

impl Transport for DatagramReceiver {
    fn transport_id(&self) -> &'static str {
        "UDP"
    }

    fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.recv_thread.take() {
            let _ = handle.join();
        }
        if self.socket.take().is_some() {
            let _enter = self.span.enter();
            tracing::debug!("UDP receiver stopped");
        }
    }
}

impl Drop for DatagramReceiver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use voice_protocol::AudioPacket;

    #[test]
    fn test_receives_audio() {
        let mut receiver = DatagramReceiver::bind("127.0.0.1:0".parse().unwrap(), Span::none()).unwrap();
        let events = receiver.take_events().unwrap();
        assert!(receiver.take_events().is_none());

        let sender = VoiceSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let audio = AudioPacket::from_samples("erin", &[3; 960]).unwrap();
        sender
            .send_to(&Packet::Audio(audio.clone()).to_bytes(), receiver.local_addr())
            .unwrap();

        let received = events.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(received.packet, audio);
        assert_eq!(receiver.stats().datagrams_received, 1);
    }

    #[test]
    fn test_connection_info_uses_advertised_ip() {
        let receiver = DatagramReceiver::bind("0.0.0.0:0".parse().unwrap(), Span::none()).unwrap();
        let info = receiver.connection_info(Some("192.168.1.20".parse().unwrap()));
        assert_eq!(info.address(), "192.168.1.20");
        assert_eq!(info.port(), receiver.local_port());

        let info = receiver.connection_info(None);
        assert_eq!(info.address(), "0.0.0.0");
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let mut receiver = DatagramReceiver::bind("127.0.0.1:0".parse().unwrap(), Span::none()).unwrap();
        receiver.shutdown();
        receiver.shutdown();
        assert!(matches!(
            receiver.send_packet(&Packet::Ping, "127.0.0.1:9".parse().unwrap()),
            Err(ReceiverError::Closed)
        ));
    }
}
