//! Voice Client - streams microphone PCM and plays relayed voices
//!
//! Reads raw 48 kHz mono s16le PCM from a file or stdin and sends it to the
//! server in 20 ms frames over the reliable stream. Audio relayed back by
//! datagram is scheduled per speaking player through a jitter buffer and
//! written to an output file as it plays.

use bytes::Bytes;
use clap::Parser;
use crossbeam::channel::Receiver;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use voice::{
    AudioPacket, ClientEvent, DatagramReceiver, JoinPacket, ReceivedAudio, ReliableClient,
    Transport,
};
use voice_cli::{
    format_buffer_stats, format_connection_stats, format_datagram_stats, init_logging,
    ClientSettings, Config,
};
use voice_io::{FramePacer, Timer};
use voice_playback::{EngineError, MemoryEngine, PlaybackManager, TaskQueue, TaskSender};
use voice_protocol::AudioFormat;

/// Samples per captured frame (20 ms at 48 kHz)
const FRAME_SAMPLES: usize = 960;

#[derive(Parser, Debug)]
#[command(name = "voice-client")]
#[command(about = "Voice chat client", long_about = None)]
struct Args {
    /// TOML configuration file with a [client] table
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Player id announced to the server
    #[arg(short, long)]
    player: Option<String>,

    /// Server address (host or host:port)
    #[arg(short, long)]
    server: Option<String>,

    /// Datagram receive port (0 picks one)
    #[arg(long)]
    udp_port: Option<u16>,

    /// Address announced for the datagram receiver
    #[arg(long)]
    advertise: Option<IpAddr>,

    /// Raw PCM input, '-' for stdin
    #[arg(short, long)]
    input: Option<String>,

    /// File receiving played audio
    #[arg(short, long)]
    output: Option<String>,

    /// Jitter buffer slots per remote player
    #[arg(long)]
    jitter_slots: Option<usize>,

    /// Statistics interval in seconds (0 disables)
    #[arg(long)]
    stats: Option<u64>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn settings(&self) -> anyhow::Result<ClientSettings> {
        let mut settings = match &self.config {
            Some(path) => Config::from_file(path)?.client.unwrap_or_default(),
            None => ClientSettings::default(),
        };
        if let Some(player) = &self.player {
            settings.player_id = player.clone();
        }
        if let Some(server) = &self.server {
            match server.rsplit_once(':') {
                Some((host, port)) if !host.ends_with(':') => {
                    settings.server_address = host.trim_matches(|c| c == '[' || c == ']').to_string();
                    settings.server_port = port.parse()?;
                }
                _ => settings.server_address = server.clone(),
            }
        }
        if let Some(port) = self.udp_port {
            settings.udp_port = port;
        }
        if self.advertise.is_some() {
            settings.advertised_ip = self.advertise;
        }
        if let Some(input) = &self.input {
            settings.input = input.clone();
        }
        if self.output.is_some() {
            settings.output = self.output.clone();
        }
        if let Some(slots) = self.jitter_slots {
            settings.jitter_slots = slots;
        }
        if let Some(stats) = self.stats {
            settings.stats_interval_secs = stats;
        }
        settings.validate()?;
        Ok(settings)
    }
}

type EngineFactory = fn(&str) -> Result<MemoryEngine, EngineError>;

fn headless_engine(_player_id: &str) -> Result<MemoryEngine, EngineError> {
    Ok(MemoryEngine::new())
}

/// State owned by the playback thread
struct Playback {
    manager: PlaybackManager<MemoryEngine, EngineFactory>,
    output: Option<BufWriter<File>>,
    local_player: String,
}

impl Playback {
    fn deliver(&mut self, packet: AudioPacket) {
        if packet.player_id() == self.local_player {
            return;
        }
        if let Err(e) = self.manager.enqueue_incoming(packet.player_id(), packet.pcm()) {
            tracing::warn!("Dropping frame from {}: {}", packet.player_id(), e);
        }
    }

    /// Play `elapsed` worth of audio on every source
    fn advance(&mut self, elapsed: Duration) -> io::Result<()> {
        for scheduler in self.manager.schedulers_mut() {
            let engine = scheduler.engine_mut();
            engine.advance_by(elapsed);
            let played = engine.take_played();
            if let Some(output) = self.output.as_mut() {
                for pcm in played {
                    output.write_all(&pcm)?;
                }
            }
        }
        self.manager.tick();
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);
    let settings = args.settings()?;

    tracing::info!("Voice Client starting as {}...", settings.player_id);
    let started = Instant::now();

    let span = tracing::info_span!("voice-client", player = %settings.player_id);
    let mut receiver =
        DatagramReceiver::bind(SocketAddr::new(settings.udp_bind, settings.udp_port), span.clone())?;
    let mut client = ReliableClient::with_readiness_timeout(settings.readiness_timeout(), span.clone());

    let server = settings.server_info()?;
    let local = client.connect(&server)?;
    tracing::info!("Connected to {} from {}", server, local);

    // Announced again by the client after every reconnect
    let announce = receiver.connection_info(settings.advertised_ip);
    client.send_join(JoinPacket::new(settings.player_id.clone(), announce.clone())?)?;
    tracing::info!("Announced datagram endpoint {}", announce);

    let datagram_events = receiver
        .take_events()
        .ok_or_else(|| anyhow::anyhow!("receiver events already taken"))?;
    let client_events = client
        .take_events()
        .ok_or_else(|| anyhow::anyhow!("client events already taken"))?;

    let running = Arc::new(AtomicBool::new(true));
    let queue = TaskQueue::new(span.clone());

    let forward_handle = {
        let tasks = queue.sender();
        let running = running.clone();
        thread::Builder::new()
            .name("voice-forward".into())
            .spawn(move || forward(datagram_events, client_events, tasks, running))?
    };

    let playback_handle = {
        let output = match &settings.output {
            Some(path) => Some(BufWriter::new(File::create(path)?)),
            None => None,
        };
        let playback = Playback {
            manager: PlaybackManager::new(
                headless_engine as EngineFactory,
                settings.playback_config(),
                span,
            ),
            output,
            local_player: settings.player_id.clone(),
        };
        let running = running.clone();
        let tick = settings.tick_interval();
        let stats_interval = settings.stats_interval();
        thread::Builder::new()
            .name("voice-playback".into())
            .spawn(move || play(queue, playback, tick, stats_interval, running))?
    };

    let result = capture(&settings, &client, &running);

    running.store(false, Ordering::Release);
    let _ = forward_handle.join();
    match playback_handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("Playback output failed: {}", e),
        Err(_) => tracing::error!("Playback thread panicked"),
    }

    tracing::info!("{}", format_connection_stats(&client.stats(), started.elapsed()));
    tracing::info!("{}", format_datagram_stats(&receiver.stats(), started.elapsed()));

    client.shutdown();
    receiver.shutdown();
    result
}

/// Read, pace and send captured frames until input ends
fn capture(
    settings: &ClientSettings,
    client: &ReliableClient,
    running: &AtomicBool,
) -> anyhow::Result<()> {
    let mut input: Box<dyn Read> = if settings.input == "-" {
        tracing::info!("Reading PCM from stdin");
        Box::new(io::stdin())
    } else {
        tracing::info!("Reading PCM from {}", settings.input);
        Box::new(BufReader::new(File::open(&settings.input)?))
    };

    let frame_len = FRAME_SAMPLES * AudioFormat::MONO16_48K.block_align();
    let mut frame = vec![0u8; frame_len];
    let mut pacer = FramePacer::new(AudioFormat::MONO16_48K.duration_of(frame_len));
    let mut sent = 0u64;

    while running.load(Ordering::Acquire) {
        match input.read_exact(&mut frame) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                tracing::info!("End of input reached after {} frames", sent);
                break;
            }
            Err(e) => return Err(e.into()),
        }

        pacer.wait_next();
        let packet = AudioPacket::new(settings.player_id.clone(), Bytes::copy_from_slice(&frame))?;
        match client.send_audio_to_server(&packet) {
            Ok(true) => sent += 1,
            Ok(false) => {}
            Err(e) => tracing::warn!("Failed to send frame: {}", e),
        }
    }
    Ok(())
}

/// Move network events onto the playback thread
fn forward(
    datagram_events: Receiver<ReceivedAudio>,
    client_events: Receiver<ClientEvent>,
    tasks: TaskSender<Playback>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Acquire) {
        crossbeam::select! {
            recv(datagram_events) -> event => match event {
                Ok(received) => {
                    tasks.post("datagram-audio", move |playback| playback.deliver(received.packet));
                }
                Err(_) => break,
            },
            recv(client_events) -> event => match event {
                Ok(ClientEvent::Audio(packet)) => {
                    tasks.post("stream-audio", move |playback| playback.deliver(packet));
                }
                Ok(ClientEvent::Disconnected { graceful: true }) => {
                    tracing::info!("Server closed the connection");
                    running.store(false, Ordering::Release);
                }
                Ok(ClientEvent::Disconnected { graceful: false }) => {
                    tracing::warn!("Connection lost, reconnecting");
                }
                Ok(ClientEvent::Reconnected { local_port }) => {
                    tracing::info!("Reconnected from local port {}, join re-sent", local_port);
                }
                Ok(ClientEvent::ReconnectFailed(reason)) => {
                    tracing::error!("Reconnect failed: {}", reason);
                    running.store(false, Ordering::Release);
                }
                Ok(ClientEvent::ProtocolViolation(reason)) => {
                    tracing::error!("Server violated the protocol: {}", reason);
                    running.store(false, Ordering::Release);
                }
                Err(_) => break,
            },
            default(Duration::from_millis(100)) => {}
        }
    }
}

/// Run posted tasks and advance playback in real time
fn play(
    queue: TaskQueue<Playback>,
    mut playback: Playback,
    tick: Duration,
    stats_interval: Option<Duration>,
    running: Arc<AtomicBool>,
) -> io::Result<()> {
    let mut stats_timer = stats_interval.map(Timer::new);
    let mut last = Instant::now();

    while running.load(Ordering::Acquire) {
        queue.run_for(&mut playback, tick);
        let now = Instant::now();
        playback.advance(now - last)?;
        last = now;

        if stats_timer.as_mut().and_then(Timer::try_fire).is_some() {
            tracing::info!(
                "{} | players: {}",
                format_buffer_stats(&playback.manager.stats()),
                playback.manager.len()
            );
        }
    }

    queue.run_pending(&mut playback);
    if let Some(output) = playback.output.as_mut() {
        output.flush()?;
    }
    Ok(())
}
