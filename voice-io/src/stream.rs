//! Reliable stream connection
//!
//! A point-to-point TCP channel carrying length-prefixed frames
//! (`[len u32 le][frame]`). Each open stream gets one receive thread that
//! hands complete frames to the registered [`ConnectionHandler`] and reports
//! how the stream ended:
//!
//! - end of stream on a frame boundary is a graceful close
//! - a read error, a reset, or end of stream inside a frame is an abrupt loss
//!
//! Local teardown ([`close`](ReliableConnection::close),
//! [`dispose`](ReliableConnection::dispose), or a
//! [`reconnect`](ReliableConnection::reconnect) replacing the stream) is never
//! reported. Every stream is tagged with a generation number; a receive thread
//! whose generation is no longer current exits silently.

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::Span;

use crate::cancel::CancellationToken;

/// Size of the frame length prefix
pub const FRAME_HEADER_SIZE: usize = 4;

/// Largest frame accepted from the peer
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Bound on a single dial attempt
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Failed to connect to {endpoint}: {source}")]
    Unreachable {
        endpoint: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Connection is not open")]
    NotConnected,

    #[error("Connection has been disposed")]
    Disposed,

    #[error("Send cancelled before the write started")]
    Cancelled,

    #[error("No endpoint to reconnect to")]
    NoEndpoint,

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Receiver of frames and disconnect notifications
///
/// Exactly one handler is registered per connection. Callbacks run on the
/// connection's receive thread, one at a time, in arrival order.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// A complete frame arrived
    fn on_message(&self, connection: &ReliableConnection, frame: Bytes);

    /// The stream ended without local teardown
    ///
    /// The receive thread ends when this returns, so blocking work such as a
    /// reconnect may run here.
    fn on_disconnected(&self, connection: &ReliableConnection, graceful: bool);
}

/// Connection statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub reconnects: u64,
}

#[derive(Default)]
struct StatCounters {
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_received: AtomicU64,
    reconnects: AtomicU64,
}

struct Inner {
    span: Span,
    writer: Mutex<Option<TcpStream>>,
    handler: RwLock<Option<Arc<dyn ConnectionHandler>>>,
    endpoint: Mutex<Option<SocketAddr>>,
    peer_addr: Mutex<Option<SocketAddr>>,
    local_addr: Mutex<Option<SocketAddr>>,
    generation: AtomicU64,
    disposed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
    stats: StatCounters,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(stream) = self.writer.get_mut().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Reliable framed stream connection
///
/// Cheap to clone; clones refer to the same underlying connection.
#[derive(Clone)]
pub struct ReliableConnection {
    inner: Arc<Inner>,
}

impl ReliableConnection {
    /// Create an unconnected connection logging under `span`
    pub fn new(span: Span) -> Self {
        ReliableConnection {
            inner: Arc::new(Inner {
                span,
                writer: Mutex::new(None),
                handler: RwLock::new(None),
                endpoint: Mutex::new(None),
                peer_addr: Mutex::new(None),
                local_addr: Mutex::new(None),
                generation: AtomicU64::new(0),
                disposed: AtomicBool::new(false),
                reader: Mutex::new(None),
                stats: StatCounters::default(),
            }),
        }
    }

    /// Wrap an accepted stream (server side)
    ///
    /// The connection has no dial endpoint and therefore cannot reconnect.
    /// Call [`start_listening`](Self::start_listening) after registering a handler.
    pub fn from_stream(stream: TcpStream, span: Span) -> Result<Self, ConnectionError> {
        let connection = ReliableConnection::new(span);
        stream.set_nodelay(true)?;
        connection.install(stream)?;
        Ok(connection)
    }

    /// Register the handler receiving frames and disconnect notifications
    pub fn set_handler(&self, handler: Arc<dyn ConnectionHandler>) {
        *self.inner.handler.write() = Some(handler);
    }

    /// Dial `endpoint`, start the receive loop, and return the local bound port
    pub fn connect(&self, endpoint: SocketAddr) -> Result<u16, ConnectionError> {
        let _enter = self.inner.span.enter();
        self.ensure_not_disposed()?;

        *self.inner.endpoint.lock() = Some(endpoint);
        let stream = dial(endpoint)?;
        self.replace_stream(stream)?;
        self.start_listening()?;

        let port = self.local_port();
        tracing::info!("Connected to {} from local port {}", endpoint, port);
        Ok(port)
    }

    /// Re-dial the last endpoint and restart the receive loop
    ///
    /// Any current stream is torn down first without being reported as a
    /// disconnect. Safe to call from inside
    /// [`ConnectionHandler::on_disconnected`].
    pub fn reconnect(&self) -> Result<u16, ConnectionError> {
        let _enter = self.inner.span.enter();
        self.ensure_not_disposed()?;

        let endpoint = (*self.inner.endpoint.lock()).ok_or(ConnectionError::NoEndpoint)?;
        self.close();

        let stream = dial(endpoint)?;
        self.replace_stream(stream)?;
        self.start_listening()?;
        self.inner.stats.reconnects.fetch_add(1, Ordering::Relaxed);

        let port = self.local_port();
        tracing::info!("Reconnected to {} from local port {}", endpoint, port);
        Ok(port)
    }

    /// Spawn the receive thread for the current stream
    pub fn start_listening(&self) -> Result<(), ConnectionError> {
        self.ensure_not_disposed()?;

        let (reader, generation) = {
            let writer = self.inner.writer.lock();
            let stream = writer.as_ref().ok_or(ConnectionError::NotConnected)?;
            (
                stream.try_clone()?,
                self.inner.generation.load(Ordering::Acquire),
            )
        };

        let weak = Arc::downgrade(&self.inner);
        let span = self.inner.span.clone();
        let handle = thread::Builder::new()
            .name("voice-stream-rx".to_string())
            .spawn(move || {
                let _entered = span.entered();
                receive_loop(weak, reader, generation);
            })?;

        // The previous receive thread (if any) has been invalidated by the
        // generation bump; it is detached rather than joined because it may be
        // the thread running this call.
        *self.inner.reader.lock() = Some(handle);
        Ok(())
    }

    /// Send one complete frame
    pub fn send(&self, frame: &[u8]) -> Result<(), ConnectionError> {
        self.ensure_not_disposed()?;
        let framed = encode_frame(frame)?;

        let mut writer = self.inner.writer.lock();
        let stream = writer.as_mut().ok_or(ConnectionError::NotConnected)?;
        stream.write_all(&framed)?;
        drop(writer);

        self.record_sent(frame.len());
        Ok(())
    }

    /// Send one complete frame on a background thread
    ///
    /// If `cancel` fires before the write starts, nothing reaches the peer.
    /// Once started, the frame is written with a single `write_all` under the
    /// writer lock, so the peer never observes a partial frame from a
    /// cancelled send.
    pub fn send_async(&self, frame: Bytes, cancel: CancellationToken) -> PendingSend {
        let inner = Arc::downgrade(&self.inner);
        let spawned = thread::Builder::new()
            .name("voice-stream-tx".to_string())
            .spawn(move || {
                if cancel.is_cancelled() {
                    return Err(ConnectionError::Cancelled);
                }
                let inner = inner.upgrade().ok_or(ConnectionError::Disposed)?;
                let connection = ReliableConnection { inner };
                connection.ensure_not_disposed()?;
                let framed = encode_frame(&frame)?;

                let mut writer = connection.inner.writer.lock();
                if cancel.is_cancelled() {
                    return Err(ConnectionError::Cancelled);
                }
                let stream = writer.as_mut().ok_or(ConnectionError::NotConnected)?;
                stream.write_all(&framed)?;
                drop(writer);

                connection.record_sent(frame.len());
                Ok(())
            });

        match spawned {
            Ok(handle) => PendingSend {
                handle: Some(handle),
                spawn_error: None,
            },
            Err(e) => PendingSend {
                handle: None,
                spawn_error: Some(e),
            },
        }
    }

    /// Tear down the current stream without reporting a disconnect
    ///
    /// The connection can be reopened with [`reconnect`](Self::reconnect).
    pub fn close(&self) {
        let mut writer = self.inner.writer.lock();
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        if let Some(stream) = writer.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// Permanently tear down the connection
    ///
    /// Idempotent. Pending sends are abandoned and the receive thread exits
    /// without invoking the handler.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.close();
        self.inner.handler.write().take();

        let reader = self.inner.reader.lock().take();
        if let Some(handle) = reader {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        let _enter = self.inner.span.enter();
        tracing::debug!("Connection disposed");
    }

    /// Local port of the current (or last) stream, 0 before the first connect
    pub fn local_port(&self) -> u16 {
        self.local_addr().map_or(0, |addr| addr.port())
    }

    /// Local address of the current (or last) stream
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// Remote address of the current (or last) stream
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.inner.peer_addr.lock()
    }

    /// Endpoint used by [`connect`](Self::connect) and [`reconnect`](Self::reconnect)
    pub fn endpoint(&self) -> Option<SocketAddr> {
        *self.inner.endpoint.lock()
    }

    /// Check if a stream is currently open
    pub fn is_connected(&self) -> bool {
        self.inner.writer.lock().is_some()
    }

    /// Check if the connection has been disposed
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Logging span of this connection
    pub fn span(&self) -> &Span {
        &self.inner.span
    }

    /// Get connection statistics
    pub fn stats(&self) -> ConnectionStats {
        let counters = &self.inner.stats;
        ConnectionStats {
            frames_sent: counters.frames_sent.load(Ordering::Relaxed),
            bytes_sent: counters.bytes_sent.load(Ordering::Relaxed),
            frames_received: counters.frames_received.load(Ordering::Relaxed),
            bytes_received: counters.bytes_received.load(Ordering::Relaxed),
            reconnects: counters.reconnects.load(Ordering::Relaxed),
        }
    }

    fn ensure_not_disposed(&self) -> Result<(), ConnectionError> {
        if self.is_disposed() {
            Err(ConnectionError::Disposed)
        } else {
            Ok(())
        }
    }

    fn install(&self, stream: TcpStream) -> Result<(), ConnectionError> {
        let local = stream.local_addr()?;
        let peer = stream.peer_addr()?;
        *self.inner.local_addr.lock() = Some(local);
        *self.inner.peer_addr.lock() = Some(peer);
        *self.inner.writer.lock() = Some(stream);
        Ok(())
    }

    fn replace_stream(&self, stream: TcpStream) -> Result<(), ConnectionError> {
        self.close();
        if self.is_disposed() {
            let _ = stream.shutdown(Shutdown::Both);
            return Err(ConnectionError::Disposed);
        }
        self.install(stream)
    }

    fn record_sent(&self, len: usize) {
        let counters = &self.inner.stats;
        counters.frames_sent.fetch_add(1, Ordering::Relaxed);
        counters.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
    }
}

/// Handle to a send running on a background thread
pub struct PendingSend {
    handle: Option<JoinHandle<Result<(), ConnectionError>>>,
    spawn_error: Option<io::Error>,
}

impl PendingSend {
    /// Block until the send finished or gave up
    pub fn wait(mut self) -> Result<(), ConnectionError> {
        if let Some(e) = self.spawn_error.take() {
            return Err(ConnectionError::Io(e));
        }
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or(Err(ConnectionError::NotConnected)),
            None => Err(ConnectionError::NotConnected),
        }
    }

    /// Check if the background send has finished
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |handle| handle.is_finished())
    }
}

fn dial(endpoint: SocketAddr) -> Result<TcpStream, ConnectionError> {
    let unreachable = |source| ConnectionError::Unreachable { endpoint, source };

    let domain = if endpoint.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(unreachable)?;
    socket
        .connect_timeout(&endpoint.into(), CONNECT_TIMEOUT)
        .map_err(unreachable)?;
    socket.set_nodelay(true).map_err(unreachable)?;
    Ok(socket.into())
}

fn encode_frame(frame: &[u8]) -> Result<BytesMut, ConnectionError> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(ConnectionError::FrameTooLarge {
            size: frame.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + frame.len());
    buf.put_u32_le(frame.len() as u32);
    buf.put_slice(frame);
    Ok(buf)
}

/// Read one frame; `Ok(None)` means the peer closed on a frame boundary
fn read_frame(stream: &mut impl Read) -> io::Result<Option<Bytes>> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    let mut filled = 0;
    while filled < header.len() {
        match stream.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds {}", len, MAX_FRAME_SIZE),
        ));
    }

    let mut body = BytesMut::zeroed(len);
    stream.read_exact(&mut body)?;
    Ok(Some(body.freeze()))
}

fn receive_loop(weak: Weak<Inner>, mut stream: TcpStream, generation: u64) {
    let graceful = loop {
        let frame = match read_frame(&mut stream) {
            Ok(Some(frame)) => frame,
            Ok(None) => break true,
            Err(e) => {
                tracing::debug!("Stream read failed: {}", e);
                break false;
            }
        };

        let Some(inner) = weak.upgrade() else { return };
        if inner.generation.load(Ordering::Acquire) != generation {
            return;
        }
        inner.stats.frames_received.fetch_add(1, Ordering::Relaxed);
        inner
            .stats
            .bytes_received
            .fetch_add(frame.len() as u64, Ordering::Relaxed);

        tracing::trace!("Received frame of {} bytes", frame.len());
        let handler = inner.handler.read().clone();
        if let Some(handler) = handler {
            handler.on_message(&ReliableConnection { inner }, frame);
        }
    };

    let Some(inner) = weak.upgrade() else { return };
    {
        // Decide under the writer lock so a concurrent reconnect either sees
        // this stream already gone or has already bumped the generation.
        let mut writer = inner.writer.lock();
        if inner.disposed.load(Ordering::Acquire)
            || inner.generation.load(Ordering::Acquire) != generation
        {
            tracing::trace!("Receive loop ended after local teardown");
            return;
        }
        inner.generation.fetch_add(1, Ordering::AcqRel);
        if let Some(stream) = writer.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    if graceful {
        tracing::info!("Peer closed the connection");
    } else {
        tracing::warn!("Connection lost");
    }

    let handler = inner.handler.read().clone();
    if let Some(handler) = handler {
        handler.on_disconnected(&ReliableConnection { inner }, graceful);
    }
}
