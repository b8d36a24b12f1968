//! Datagram receive loop shared by the server and the client receiver

use crossbeam::channel::Sender;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::Span;
use voice_io::socket::MAX_DATAGRAM_SIZE;
use voice_io::VoiceSocket;
use voice_protocol::{AudioPacket, Packet};

/// How long a receive loop blocks before checking for shutdown
pub(crate) const RECV_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Audio frame received by datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedAudio {
    pub from: SocketAddr,
    pub packet: AudioPacket,
}

/// Datagram endpoint statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatagramStats {
    pub datagrams_received: u64,
    pub datagrams_sent: u64,
    /// Datagrams with an unrecognized packet type
    pub protocol_errors: u64,
    /// Datagrams of a known type that failed to decode
    pub malformed: u64,
    /// Sends addressed to a player that is not registered
    pub unknown_peer_sends: u64,
}

#[derive(Default)]
pub(crate) struct DatagramCounters {
    pub received: AtomicU64,
    pub sent: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub malformed: AtomicU64,
    pub unknown_peer_sends: AtomicU64,
}

impl DatagramCounters {
    pub fn snapshot(&self) -> DatagramStats {
        DatagramStats {
            datagrams_received: self.received.load(Ordering::Relaxed),
            datagrams_sent: self.sent.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            unknown_peer_sends: self.unknown_peer_sends.load(Ordering::Relaxed),
        }
    }
}

/// Spawn the receive loop for `socket`
///
/// Audio is forwarded to `events`, Ping is answered with Pong to the sender,
/// and anything else is logged and dropped. The loop exits once `running`
/// is cleared (observed within [`RECV_POLL_INTERVAL`]).
pub(crate) fn spawn_receive_loop(
    name: &str,
    socket: VoiceSocket,
    events: Sender<ReceivedAudio>,
    counters: Arc<DatagramCounters>,
    running: Arc<AtomicBool>,
    span: Span,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new().name(name.to_string()).spawn(move || {
        let _entered = span.entered();
        receive_loop(&socket, &events, &counters, &running);
        tracing::debug!("Datagram receive loop stopped");
    })
}

fn receive_loop(
    socket: &VoiceSocket,
    events: &Sender<ReceivedAudio>,
    counters: &DatagramCounters,
    running: &AtomicBool,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    while running.load(Ordering::Acquire) {
        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(Some(received)) => received,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!("Datagram receive failed: {}", e);
                thread::sleep(RECV_POLL_INTERVAL);
                continue;
            }
        };
        counters.received.fetch_add(1, Ordering::Relaxed);

        match Packet::from_bytes(&buf[..len]) {
            Ok(Packet::Audio(packet)) => {
                tracing::trace!(
                    "Audio from {} ({}, {} samples)",
                    from,
                    packet.player_id(),
                    packet.sample_count()
                );
                let _ = events.send(ReceivedAudio { from, packet });
            }
            Ok(Packet::Ping) => match socket.send_to(&Packet::Pong.to_bytes(), from) {
                Ok(_) => {
                    counters.sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => tracing::debug!("Failed to answer Ping from {}: {}", from, e),
            },
            Ok(other) => {
                tracing::debug!("Ignoring {} datagram from {}", other.packet_type(), from);
            }
            Err(e) if e.is_unknown_type() => {
                counters.protocol_errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!("Dropping datagram from {}: {}", from, e);
            }
            Err(e) => {
                counters.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Malformed datagram from {}: {}", from, e);
            }
        }
    }
}
