//! Voice Server - relays player audio
//!
//! Accepts players over the reliable stream, registers the datagram endpoint
//! each one announces with a Join packet, and relays every audio frame to the
//! other registered players by datagram. Stream audio is only relayed when
//! its player id matches the Join of the stream it arrived on.

use clap::Parser;
use crossbeam::channel::{self, Receiver};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use voice::{
    AudioPacket, ConnectionInfo, DatagramServer, ListenerEvent, Packet, ReceivedAudio, ReliableListener,
    ServerError, Transport,
};
use voice_cli::{format_datagram_stats, init_logging, Config, ServerSettings};

#[derive(Parser, Debug)]
#[command(name = "voice-server")]
#[command(about = "Voice relay server", long_about = None)]
struct Args {
    /// TOML configuration file with a [server] table
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Local address for both listeners
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Stream (TCP) port
    #[arg(long)]
    tcp_port: Option<u16>,

    /// Datagram (UDP) port
    #[arg(long)]
    udp_port: Option<u16>,

    /// Address advertised to players
    #[arg(long)]
    public_ip: Option<IpAddr>,

    /// Statistics interval in seconds (0 disables)
    #[arg(long)]
    stats: Option<u64>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn settings(&self) -> anyhow::Result<ServerSettings> {
        let mut settings = match &self.config {
            Some(path) => Config::from_file(path)?.server.unwrap_or_default(),
            None => ServerSettings::default(),
        };
        if let Some(bind) = self.bind {
            settings.bind = bind;
        }
        if let Some(port) = self.tcp_port {
            settings.tcp_port = port;
        }
        if let Some(port) = self.udp_port {
            settings.udp_port = port;
        }
        if self.public_ip.is_some() {
            settings.public_ip = self.public_ip;
        }
        if let Some(stats) = self.stats {
            settings.stats_interval_secs = stats;
        }
        Ok(settings)
    }
}

/// Player bookkeeping shared by both transports
struct Relay {
    server: DatagramServer,
    peers: HashMap<SocketAddr, String>,
}

impl Relay {
    fn join(&mut self, peer: SocketAddr, player_id: String, info: ConnectionInfo) {
        // A rejoin replaces the previous endpoint
        if self.server.player_disconnected(&player_id).is_some() {
            tracing::info!("Player {} rejoined from {}", player_id, peer);
        }
        match self.server.player_connected(player_id.clone(), info.clone()) {
            Ok(()) => {
                tracing::info!("Player {} joined, receiving at {}", player_id, info);
                self.peers.insert(peer, player_id);
            }
            Err(e) => tracing::warn!("Cannot register player {}: {}", player_id, e),
        }
    }

    fn leave(&mut self, peer: SocketAddr, graceful: bool) {
        let Some(player_id) = self.peers.remove(&peer) else {
            tracing::debug!("Unregistered peer {} disconnected", peer);
            return;
        };
        // The id may have rejoined from another stream
        if self.peers.values().any(|id| id == &player_id) {
            return;
        }
        self.server.player_disconnected(&player_id);
        if graceful {
            tracing::info!("Player {} left", player_id);
        } else {
            tracing::warn!("Lost connection to player {}", player_id);
        }
    }

    /// Relay audio received on a player's stream
    ///
    /// Returns false when the stream has not joined or the frame claims
    /// another player's id.
    fn relay_from_peer(&self, peer: SocketAddr, packet: AudioPacket) -> bool {
        match self.peers.get(&peer) {
            Some(player_id) if player_id == packet.player_id() => {
                self.relay(packet);
                true
            }
            Some(player_id) => {
                tracing::warn!(
                    "Dropping audio for {} from {} joined as {}",
                    packet.player_id(),
                    peer,
                    player_id
                );
                false
            }
            None => {
                tracing::debug!("Dropping audio for {} from unjoined peer {}", packet.player_id(), peer);
                false
            }
        }
    }

    /// Relay audio received by datagram from a registered player
    fn relay_datagram(&self, received: ReceivedAudio) -> bool {
        if !self.server.is_registered(received.packet.player_id()) {
            tracing::debug!(
                "Dropping datagram audio for unregistered {} from {}",
                received.packet.player_id(),
                received.from
            );
            return false;
        }
        self.relay(received.packet);
        true
    }

    /// Send `packet` to every registered player except its speaker
    fn relay(&self, packet: AudioPacket) {
        let recipients: Vec<String> = self
            .server
            .players()
            .filter(|id| *id != packet.player_id())
            .map(str::to_string)
            .collect();
        if recipients.is_empty() {
            return;
        }

        let speaker = packet.player_id().to_string();
        let packet = Packet::Audio(packet);
        for player_id in recipients {
            match self.server.send_packet(&packet, &player_id) {
                Ok(()) => {}
                Err(ServerError::UnknownPeer(_)) => {}
                Err(e) => tracing::warn!("Relay from {} to {} failed: {}", speaker, player_id, e),
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);
    let settings = args.settings()?;

    tracing::info!("Voice Server starting...");

    let span = tracing::info_span!("voice-server");
    let mut listener =
        ReliableListener::bind(SocketAddr::new(settings.bind, settings.tcp_port), span.clone())?;
    let mut server = DatagramServer::new(settings.datagram_config(), span);
    server.launch()?;

    tracing::info!("Stream endpoint: {}", listener.local_addr());
    tracing::info!("Datagram endpoint: {}", server.get_connection()?);

    let stream_events = listener
        .take_events()
        .ok_or_else(|| anyhow::anyhow!("listener events already taken"))?;
    let datagram_events = server
        .take_events()
        .ok_or_else(|| anyhow::anyhow!("server events already taken"))?;
    let stats_ticker = match settings.stats_interval() {
        Some(interval) => channel::tick(interval),
        None => channel::never(),
    };

    let mut relay = Relay {
        server,
        peers: HashMap::new(),
    };
    run(&mut relay, &stream_events, &datagram_events, &stats_ticker);

    tracing::info!("Shutting down");
    listener.shutdown();
    relay.server.shutdown();
    Ok(())
}

fn run(
    relay: &mut Relay,
    stream_events: &Receiver<ListenerEvent>,
    datagram_events: &Receiver<ReceivedAudio>,
    stats_ticker: &Receiver<Instant>,
) {
    let started = Instant::now();
    loop {
        crossbeam::select! {
            recv(stream_events) -> event => match event {
                Ok(ListenerEvent::Join { peer, join }) => {
                    let (player_id, info) = join.into_parts();
                    relay.join(peer, player_id, info);
                }
                Ok(ListenerEvent::Audio { peer, packet }) => {
                    relay.relay_from_peer(peer, packet);
                }
                Ok(ListenerEvent::PeerDisconnected { peer, graceful }) => relay.leave(peer, graceful),
                Err(_) => break,
            },
            recv(datagram_events) -> event => match event {
                Ok(received) => {
                    relay.relay_datagram(received);
                }
                Err(_) => break,
            },
            recv(stats_ticker) -> _ => {
                tracing::info!(
                    "{} | players: {}",
                    format_datagram_stats(&relay.server.stats(), started.elapsed()),
                    relay.peers.len()
                );
            },
            default(Duration::from_secs(1)) => {
                if !relay.server.is_running() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use voice::{DatagramReceiver, ServerConfig};

    const WAIT: Duration = Duration::from_millis(300);

    fn loopback_relay() -> Relay {
        let mut server = DatagramServer::new(
            ServerConfig {
                bind_ip: Ipv4Addr::LOCALHOST.into(),
                port: 0,
                public_ip: Some(Ipv4Addr::LOCALHOST.into()),
            },
            tracing::Span::none(),
        );
        server.launch().unwrap();
        Relay {
            server,
            peers: HashMap::new(),
        }
    }

    fn listener_endpoint() -> (DatagramReceiver, Receiver<ReceivedAudio>) {
        let mut receiver =
            DatagramReceiver::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)), tracing::Span::none())
                .unwrap();
        let audio = receiver.take_events().unwrap();
        (receiver, audio)
    }

    #[test]
    fn test_stream_audio_must_match_join() {
        let mut relay = loopback_relay();
        let alice_peer: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        let stranger: SocketAddr = "127.0.0.1:40002".parse().unwrap();

        let (alice, _alice_audio) = listener_endpoint();
        let (bob, bob_audio) = listener_endpoint();
        relay.join(alice_peer, "alice".to_string(), alice.connection_info(None));
        relay.join("127.0.0.1:40003".parse().unwrap(), "bob".to_string(), bob.connection_info(None));

        // Unjoined stream
        let frame = AudioPacket::from_samples("alice", &[1; 960]).unwrap();
        assert!(!relay.relay_from_peer(stranger, frame.clone()));

        // Joined stream claiming another id
        let spoofed = AudioPacket::from_samples("carol", &[2; 960]).unwrap();
        assert!(!relay.relay_from_peer(alice_peer, spoofed));
        assert!(bob_audio.recv_timeout(WAIT).is_err());

        assert!(relay.relay_from_peer(alice_peer, frame.clone()));
        assert_eq!(bob_audio.recv_timeout(WAIT).unwrap().packet, frame);
    }

    #[test]
    fn test_datagram_audio_requires_registration() {
        let mut relay = loopback_relay();
        let (bob, bob_audio) = listener_endpoint();
        relay.join("127.0.0.1:40004".parse().unwrap(), "bob".to_string(), bob.connection_info(None));

        let from: SocketAddr = "127.0.0.1:40005".parse().unwrap();
        let unregistered = ReceivedAudio {
            from,
            packet: AudioPacket::from_samples("mallory", &[3; 960]).unwrap(),
        };
        assert!(!relay.relay_datagram(unregistered));
        assert!(bob_audio.recv_timeout(WAIT).is_err());
    }
}
