//! Stream client disconnect and reconnect behavior
//!
//! A scripted server on loopback answers the readiness probe and then ends
//! the connection either gracefully (FIN) or abruptly (RST).

use crossbeam::channel::Receiver;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};
use voice::protocol::HandshakeError;
use voice::{
    AudioPacket, ClientError, ClientEvent, ConnectionInfo, ConnectionState, JoinPacket, Packet,
    ReliableClient,
};

const EVENT_WAIT: Duration = Duration::from_secs(5);

/// Helper to read one length-prefixed packet
fn read_packet(stream: &mut TcpStream) -> Packet {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).unwrap();
    let mut body = vec![0u8; u32::from_le_bytes(header) as usize];
    stream.read_exact(&mut body).unwrap();
    Packet::from_bytes(&body).unwrap()
}

/// Helper to write one length-prefixed packet
fn write_packet(stream: &mut TcpStream, packet: &Packet) {
    let bytes = packet.to_bytes();
    stream.write_all(&(bytes.len() as u32).to_le_bytes()).unwrap();
    stream.write_all(&bytes).unwrap();
}

/// Accept one client and answer its readiness probe
fn accept_ready(listener: &TcpListener) -> TcpStream {
    let (mut stream, _) = listener.accept().unwrap();
    assert_eq!(read_packet(&mut stream), Packet::Ping);
    write_packet(&mut stream, &Packet::Pong);
    stream
}

/// Close with RST instead of FIN
fn reset(stream: TcpStream) {
    socket2::SockRef::from(&stream)
        .set_linger(Some(Duration::ZERO))
        .unwrap();
    drop(stream);
}

fn next_event(events: &Receiver<ClientEvent>) -> ClientEvent {
    events.recv_timeout(EVENT_WAIT).expect("client event")
}

fn connected_client(listener: &TcpListener) -> (ReliableClient, Receiver<ClientEvent>, TcpStream) {
    let server = ConnectionInfo::from(listener.local_addr().unwrap());
    let accept = {
        let listener = listener.try_clone().unwrap();
        thread::spawn(move || accept_ready(&listener))
    };

    let mut client = ReliableClient::with_readiness_timeout(EVENT_WAIT, tracing::Span::none());
    client.connect(&server).unwrap();
    let events = client.take_events().unwrap();
    let stream = accept.join().unwrap();
    (client, events, stream)
}

#[test]
fn test_graceful_close_does_not_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let (client, events, stream) = connected_client(&listener);
    assert!(client.is_ready());

    stream.shutdown(std::net::Shutdown::Both).unwrap();
    drop(stream);

    assert_eq!(next_event(&events), ClientEvent::Disconnected { graceful: true });
    assert!(events.recv_timeout(Duration::from_millis(500)).is_err());

    listener.set_nonblocking(true).unwrap();
    assert!(listener.accept().is_err(), "client must not dial again");
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.handshakes(), 1);
    assert_eq!(client.stats().reconnects, 0);
}

#[test]
fn test_abrupt_loss_reconnects_once() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let (client, events, stream) = connected_client(&listener);

    let second = {
        let listener = listener.try_clone().unwrap();
        thread::spawn(move || accept_ready(&listener))
    };
    reset(stream);

    assert_eq!(next_event(&events), ClientEvent::Disconnected { graceful: false });
    let ClientEvent::Reconnected { local_port } = next_event(&events) else {
        panic!("expected reconnect");
    };
    let mut stream = second.join().unwrap();
    assert_eq!(stream.peer_addr().unwrap().port(), local_port);

    assert!(client.is_ready());
    assert_eq!(client.handshakes(), 2);
    assert_eq!(client.stats().reconnects, 1);

    // The new stream carries audio
    let audio = AudioPacket::from_samples("dana", &[42; 960]).unwrap();
    assert!(client.send_audio_to_server(&audio).unwrap());
    assert_eq!(read_packet(&mut stream), Packet::Audio(audio));

    // No further attempts
    assert!(events.recv_timeout(Duration::from_millis(300)).is_err());
}

#[test]
fn test_failed_reconnect_is_reported() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let (client, events, stream) = connected_client(&listener);

    drop(listener);
    reset(stream);

    assert_eq!(next_event(&events), ClientEvent::Disconnected { graceful: false });
    assert!(matches!(next_event(&events), ClientEvent::ReconnectFailed(_)));
    assert!(!client.is_ready());

    let audio = AudioPacket::from_samples("dana", &[1; 960]).unwrap();
    assert!(!client.send_audio_to_server(&audio).unwrap());
}

#[test]
fn test_reconnect_to_silent_server_leaves_client_not_ready() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let server = ConnectionInfo::from(listener.local_addr().unwrap());
    let accept = {
        let listener = listener.try_clone().unwrap();
        thread::spawn(move || accept_ready(&listener))
    };

    let mut client =
        ReliableClient::with_readiness_timeout(Duration::from_millis(300), tracing::Span::none());
    client.connect(&server).unwrap();
    let events = client.take_events().unwrap();
    let stream = accept.join().unwrap();

    // Second connection is accepted but never answered
    let silent = {
        let listener = listener.try_clone().unwrap();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            assert_eq!(read_packet(&mut stream), Packet::Ping);
            let mut rest = Vec::new();
            // Client gives up and closes the stream
            let _ = stream.read_to_end(&mut rest);
        })
    };
    reset(stream);

    assert_eq!(next_event(&events), ClientEvent::Disconnected { graceful: false });
    assert!(matches!(next_event(&events), ClientEvent::ReconnectFailed(_)));
    silent.join().unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.handshakes(), 1);
}

#[test]
fn test_reset_during_initial_handshake_does_not_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let server = ConnectionInfo::from(listener.local_addr().unwrap());

    // Reset the first stream after its Ping, then answer any second dial
    let script = {
        let listener = listener.try_clone().unwrap();
        thread::spawn(move || {
            let (mut first, _) = listener.accept().unwrap();
            assert_eq!(read_packet(&mut first), Packet::Ping);
            reset(first);

            listener.set_nonblocking(true).unwrap();
            let deadline = Instant::now() + Duration::from_millis(500);
            while Instant::now() < deadline {
                if let Ok((mut second, _)) = listener.accept() {
                    second.set_nonblocking(false).unwrap();
                    assert_eq!(read_packet(&mut second), Packet::Ping);
                    write_packet(&mut second, &Packet::Pong);
                    return true;
                }
                thread::sleep(Duration::from_millis(10));
            }
            false
        })
    };

    let mut client = ReliableClient::with_readiness_timeout(EVENT_WAIT, tracing::Span::none());
    let err = client.connect(&server).unwrap_err();
    assert!(matches!(err, ClientError::Handshake(HandshakeError::Aborted)));

    let redialed = script.join().unwrap();
    assert!(!redialed, "client dialed again after a failed first handshake");
    assert!(!client.is_ready());
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.handshakes(), 0);
}

#[test]
fn test_reconnect_replays_join() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let (client, events, mut stream) = connected_client(&listener);

    let info = ConnectionInfo::new("127.0.0.1", 40000).unwrap();
    let join = JoinPacket::new("dana", info).unwrap();
    client.send_join(join.clone()).unwrap();
    assert_eq!(read_packet(&mut stream), Packet::Join(join.clone()));

    let second = {
        let listener = listener.try_clone().unwrap();
        thread::spawn(move || accept_ready(&listener))
    };
    reset(stream);

    assert_eq!(next_event(&events), ClientEvent::Disconnected { graceful: false });
    assert!(matches!(next_event(&events), ClientEvent::Reconnected { .. }));
    let mut stream = second.join().unwrap();
    assert_eq!(read_packet(&mut stream), Packet::Join(join));
}
