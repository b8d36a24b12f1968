//! Voice Packet Structures and Serialization
//!
//! Every packet starts with a 4-byte little-endian type code followed by a
//! type-specific payload. The same encoding is used on both transports: the
//! reliable stream carries one packet per length-prefixed frame, the datagram
//! transport carries one packet per datagram.
//!
//! ```text
//! Ping  : [type=0]
//! Pong  : [type=1]
//! Audio : [type=2][id_len u32][player_id utf8][pcm_len u32][pcm s16le mono 48 kHz]
//! Join  : [type=3][id_len u32][player_id utf8][addr_len u32][address utf8][port u16]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;
use thiserror::Error;

/// Size of the packet type header in bytes
pub const HEADER_SIZE: usize = 4;

/// Size of a length field inside a payload
const LENGTH_FIELD_SIZE: usize = 4;

/// Size of the port field of a serialized ConnectionInfo
const PORT_FIELD_SIZE: usize = 2;

/// Maximum PCM payload carried by one audio packet (fits a single UDP datagram)
pub const MAX_PCM_BYTES: usize = 32 * 1024;

/// Maximum length of a player id in bytes
pub const MAX_PLAYER_ID_LEN: usize = 256;

/// Maximum length of an address string in bytes
pub const MAX_ADDRESS_LEN: usize = 255;

/// Samples in one 20 ms frame at 48 kHz
pub const FRAME_SAMPLES: usize = 960;

/// Packet type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum PacketType {
    /// Readiness probe request
    Ping = 0,
    /// Readiness probe answer
    Pong = 1,
    /// Raw PCM audio frame
    Audio = 2,
    /// Player announcement carrying its datagram endpoint
    Join = 3,
}

impl PacketType {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(PacketType::Ping),
            1 => Some(PacketType::Pong),
            2 => Some(PacketType::Audio),
            3 => Some(PacketType::Join),
            _ => None,
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    /// Read the type code of an encoded packet without decoding the payload
    pub fn peek(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < HEADER_SIZE {
            return Err(PacketError::InsufficientData {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        let mut buf = &bytes[..HEADER_SIZE];
        let code = buf.get_i32_le();
        PacketType::from_code(code).ok_or(PacketError::UnknownType(code))
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketType::Ping => write!(f, "Ping"),
            PacketType::Pong => write!(f, "Pong"),
            PacketType::Audio => write!(f, "Audio"),
            PacketType::Join => write!(f, "Join"),
        }
    }
}

/// Fixed PCM format carried by audio packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl AudioFormat {
    /// 48 kHz, mono, signed 16-bit little-endian
    pub const MONO16_48K: AudioFormat = AudioFormat {
        sample_rate: 48_000,
        channels: 1,
        bits_per_sample: 16,
    };

    /// Bytes per sample frame (all channels)
    pub fn block_align(&self) -> usize {
        self.channels as usize * (self.bits_per_sample as usize / 8)
    }

    /// Playback duration of `len` bytes of PCM in this format
    pub fn duration_of(&self, len: usize) -> Duration {
        let frames = (len / self.block_align()) as u64;
        Duration::from_micros(frames * 1_000_000 / self.sample_rate as u64)
    }
}

/// Network endpoint as exchanged between peers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawConnectionInfo")]
pub struct ConnectionInfo {
    address: String,
    port: u16,
}

#[derive(Deserialize)]
struct RawConnectionInfo {
    address: String,
    port: u16,
}

impl TryFrom<RawConnectionInfo> for ConnectionInfo {
    type Error = PacketError;

    fn try_from(raw: RawConnectionInfo) -> Result<Self, Self::Error> {
        ConnectionInfo::new(raw.address, raw.port)
    }
}

impl ConnectionInfo {
    /// Fails if the address does not fit the wire encoding
    pub fn new(address: impl Into<String>, port: u16) -> Result<Self, PacketError> {
        let address = address.into();
        check_string_len(&address, MAX_ADDRESS_LEN)?;
        Ok(ConnectionInfo { address, port })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolve to the first socket address (performs a DNS lookup for host names)
    pub fn resolve(&self) -> io::Result<SocketAddr> {
        self.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no address found for {}", self),
            )
        })
    }

    /// Serialize into `buf` (little-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        put_string(buf, &self.address);
        buf.put_u16_le(self.port);
    }

    /// Parse from the front of `buf`, advancing it past the consumed bytes
    pub fn decode(buf: &mut &[u8]) -> Result<Self, PacketError> {
        let address = get_string(buf, MAX_ADDRESS_LEN)?;
        ensure_remaining(buf, PORT_FIELD_SIZE)?;
        let port = buf.get_u16_le();
        Ok(ConnectionInfo { address, port })
    }

    fn encoded_len(&self) -> usize {
        LENGTH_FIELD_SIZE + self.address.len() + PORT_FIELD_SIZE
    }
}

impl From<SocketAddr> for ConnectionInfo {
    fn from(addr: SocketAddr) -> Self {
        ConnectionInfo {
            address: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl ToSocketAddrs for ConnectionInfo {
    type Iter = std::vec::IntoIter<SocketAddr>;

    fn to_socket_addrs(&self) -> io::Result<Self::Iter> {
        (self.address.as_str(), self.port).to_socket_addrs()
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.address.contains(':') {
            write!(f, "[{}]:{}", self.address, self.port)
        } else {
            write!(f, "{}:{}", self.address, self.port)
        }
    }
}

/// One frame of raw PCM from a speaking player
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPacket {
    player_id: String,
    pcm: Bytes,
}

impl AudioPacket {
    pub fn new(player_id: impl Into<String>, pcm: Bytes) -> Result<Self, PacketError> {
        let packet = AudioPacket {
            player_id: player_id.into(),
            pcm,
        };
        packet.validate()?;
        Ok(packet)
    }

    /// Player whose voice this frame carries
    pub fn player_id(&self) -> &str {
        &self.player_id
    }

    /// Mono signed 16-bit little-endian samples at 48 kHz
    pub fn pcm(&self) -> &Bytes {
        &self.pcm
    }

    /// Build a packet from native samples
    pub fn from_samples(player_id: impl Into<String>, samples: &[i16]) -> Result<Self, PacketError> {
        let mut pcm = BytesMut::with_capacity(samples.len() * 2);
        for &sample in samples {
            pcm.put_i16_le(sample);
        }
        AudioPacket::new(player_id, pcm.freeze())
    }

    /// Decode the PCM payload into native samples
    pub fn samples(&self) -> Vec<i16> {
        self.pcm
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect()
    }

    /// Number of samples in the frame
    pub fn sample_count(&self) -> usize {
        self.pcm.len() / AudioFormat::MONO16_48K.block_align()
    }

    /// Playback duration of the frame
    pub fn duration(&self) -> Duration {
        AudioFormat::MONO16_48K.duration_of(self.pcm.len())
    }

    fn validate(&self) -> Result<(), PacketError> {
        check_string_len(&self.player_id, MAX_PLAYER_ID_LEN)?;
        if self.pcm.len() > MAX_PCM_BYTES {
            return Err(PacketError::PayloadTooLarge {
                size: self.pcm.len(),
                max: MAX_PCM_BYTES,
            });
        }
        if self.pcm.len() % AudioFormat::MONO16_48K.block_align() != 0 {
            return Err(PacketError::OddPcmLength(self.pcm.len()));
        }
        Ok(())
    }

    fn encoded_len(&self) -> usize {
        LENGTH_FIELD_SIZE + self.player_id.len() + LENGTH_FIELD_SIZE + self.pcm.len()
    }

    fn encode(&self, buf: &mut BytesMut) {
        put_string(buf, &self.player_id);
        buf.put_u32_le(self.pcm.len() as u32);
        buf.put_slice(&self.pcm);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, PacketError> {
        let player_id = get_string(buf, MAX_PLAYER_ID_LEN)?;
        ensure_remaining(buf, LENGTH_FIELD_SIZE)?;
        let declared = buf.get_u32_le() as usize;
        if declared > MAX_PCM_BYTES {
            return Err(PacketError::PayloadTooLarge {
                size: declared,
                max: MAX_PCM_BYTES,
            });
        }
        if declared > buf.remaining() {
            return Err(PacketError::LengthMismatch {
                declared,
                available: buf.remaining(),
            });
        }
        let pcm = buf.copy_to_bytes(declared);
        let packet = AudioPacket { player_id, pcm };
        packet.validate()?;
        Ok(packet)
    }
}

/// Announcement of the datagram endpoint a player receives audio on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinPacket {
    player_id: String,
    info: ConnectionInfo,
}

impl JoinPacket {
    pub fn new(player_id: impl Into<String>, info: ConnectionInfo) -> Result<Self, PacketError> {
        let player_id = player_id.into();
        check_string_len(&player_id, MAX_PLAYER_ID_LEN)?;
        Ok(JoinPacket { player_id, info })
    }

    pub fn player_id(&self) -> &str {
        &self.player_id
    }

    /// Datagram endpoint the player receives audio on
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn into_parts(self) -> (String, ConnectionInfo) {
        (self.player_id, self.info)
    }

    fn encoded_len(&self) -> usize {
        LENGTH_FIELD_SIZE + self.player_id.len() + self.info.encoded_len()
    }

    fn encode(&self, buf: &mut BytesMut) {
        put_string(buf, &self.player_id);
        self.info.encode(buf);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, PacketError> {
        let player_id = get_string(buf, MAX_PLAYER_ID_LEN)?;
        let info = ConnectionInfo::decode(buf)?;
        Ok(JoinPacket { player_id, info })
    }
}

/// Any packet understood by the voice transports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Ping,
    Pong,
    Audio(AudioPacket),
    Join(JoinPacket),
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Ping => PacketType::Ping,
            Packet::Pong => PacketType::Pong,
            Packet::Audio(_) => PacketType::Audio,
            Packet::Join(_) => PacketType::Join,
        }
    }

    /// Total encoded size of the packet
    pub fn size(&self) -> usize {
        HEADER_SIZE
            + match self {
                Packet::Ping | Packet::Pong => 0,
                Packet::Audio(audio) => audio.encoded_len(),
                Packet::Join(join) => join.encoded_len(),
            }
    }

    /// Serialize the packet to bytes
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.size());
        buf.put_i32_le(self.packet_type().code());
        match self {
            Packet::Ping | Packet::Pong => {}
            Packet::Audio(audio) => audio.encode(&mut buf),
            Packet::Join(join) => join.encode(&mut buf),
        }
        buf
    }

    /// Parse a packet from bytes
    ///
    /// Decoding is strict: trailing bytes after the payload are rejected so
    /// that a successfully decoded packet re-encodes to the identical bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        let packet_type = PacketType::peek(bytes)?;
        let mut buf = &bytes[HEADER_SIZE..];

        let packet = match packet_type {
            PacketType::Ping => Packet::Ping,
            PacketType::Pong => Packet::Pong,
            PacketType::Audio => Packet::Audio(AudioPacket::decode(&mut buf)?),
            PacketType::Join => Packet::Join(JoinPacket::decode(&mut buf)?),
        };

        if buf.has_remaining() {
            return Err(PacketError::TrailingData {
                packet_type,
                extra: buf.remaining(),
            });
        }
        Ok(packet)
    }
}

impl From<AudioPacket> for Packet {
    fn from(packet: AudioPacket) -> Self {
        Packet::Audio(packet)
    }
}

impl From<JoinPacket> for Packet {
    fn from(packet: JoinPacket) -> Self {
        Packet::Join(packet)
    }
}

/// Packet parsing and validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Insufficient data: expected {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("Unknown packet type: {0}")]
    UnknownType(i32),

    #[error("{extra} trailing bytes after {packet_type} packet")]
    TrailingData { packet_type: PacketType, extra: usize },

    #[error("Declared length {declared} exceeds available {available} bytes")]
    LengthMismatch { declared: usize, available: usize },

    #[error("PCM length {0} is not a whole number of 16-bit samples")]
    OddPcmLength(usize),

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("String field too long: {len} bytes (max {max})")]
    StringTooLong { len: usize, max: usize },

    #[error("String field is not valid UTF-8")]
    InvalidUtf8,
}

impl PacketError {
    /// Whether the error is an unrecognized type code rather than a malformed payload
    pub fn is_unknown_type(&self) -> bool {
        matches!(self, PacketError::UnknownType(_))
    }
}

fn ensure_remaining(buf: &&[u8], needed: usize) -> Result<(), PacketError> {
    if buf.remaining() < needed {
        return Err(PacketError::InsufficientData {
            expected: needed,
            actual: buf.remaining(),
        });
    }
    Ok(())
}

fn check_string_len(value: &str, max: usize) -> Result<(), PacketError> {
    if value.len() > max {
        return Err(PacketError::StringTooLong {
            len: value.len(),
            max,
        });
    }
    Ok(())
}

fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

fn get_string(buf: &mut &[u8], max: usize) -> Result<String, PacketError> {
    ensure_remaining(buf, LENGTH_FIELD_SIZE)?;
    let len = buf.get_u32_le() as usize;
    if len > max {
        return Err(PacketError::StringTooLong { len, max });
    }
    ensure_remaining(buf, len)?;
    let value = std::str::from_utf8(&buf[..len])
        .map_err(|_| PacketError::InvalidUtf8)?
        .to_owned();
    buf.advance(len);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_frame() -> Vec<i16> {
        (0..FRAME_SAMPLES)
            .map(|i| ((i as f32 * 0.05).sin() * 8000.0) as i16)
            .collect()
    }

    #[test]
    fn test_ping_pong_wire_format() {
        assert_eq!(&Packet::Ping.to_bytes()[..], &[0, 0, 0, 0]);
        assert_eq!(&Packet::Pong.to_bytes()[..], &[1, 0, 0, 0]);
        assert_eq!(Packet::from_bytes(&[1, 0, 0, 0]).unwrap(), Packet::Pong);
    }

    #[test]
    fn test_audio_packet_serialization() {
        let audio = AudioPacket::from_samples("alice", &sine_frame()).unwrap();
        assert_eq!(audio.sample_count(), FRAME_SAMPLES);
        assert_eq!(audio.duration(), Duration::from_millis(20));

        let bytes = Packet::Audio(audio.clone()).to_bytes();
        assert_eq!(&bytes[..4], &2i32.to_le_bytes());

        let decoded = Packet::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, Packet::Audio(audio.clone()));
        if let Packet::Audio(decoded) = decoded {
            assert_eq!(decoded.samples(), sine_frame());
        }
    }

    #[test]
    fn test_join_packet_serialization() {
        let join =
            JoinPacket::new("bob", ConnectionInfo::new("192.168.1.20", 52000).unwrap()).unwrap();
        let bytes = Packet::Join(join.clone()).to_bytes();
        assert_eq!(bytes.len(), Packet::Join(join.clone()).size());
        assert_eq!(Packet::from_bytes(&bytes).unwrap(), Packet::Join(join));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = Packet::from_bytes(&[7, 0, 0, 0]).unwrap_err();
        assert_eq!(err, PacketError::UnknownType(7));
        assert!(err.is_unknown_type());

        let err = Packet::from_bytes(&(-1i32).to_le_bytes()).unwrap_err();
        assert_eq!(err, PacketError::UnknownType(-1));
    }

    #[test]
    fn test_short_header_rejected() {
        let err = Packet::from_bytes(&[0, 0]).unwrap_err();
        assert_eq!(
            err,
            PacketError::InsufficientData {
                expected: 4,
                actual: 2
            }
        );
    }

    #[test]
    fn test_trailing_data_rejected() {
        let err = Packet::from_bytes(&[0, 0, 0, 0, 9]).unwrap_err();
        assert!(matches!(err, PacketError::TrailingData { extra: 1, .. }));
    }

    #[test]
    fn test_audio_length_mismatch() {
        let audio = AudioPacket::from_samples("a", &[1, 2, 3]).unwrap();
        let bytes = Packet::Audio(audio).to_bytes();
        let truncated = &bytes[..bytes.len() - 2];
        assert!(matches!(
            Packet::from_bytes(truncated),
            Err(PacketError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_odd_pcm_rejected() {
        let err = AudioPacket::new("a", Bytes::from_static(&[1, 2, 3])).unwrap_err();
        assert_eq!(err, PacketError::OddPcmLength(3));
    }

    #[test]
    fn test_oversized_pcm_rejected() {
        let pcm = Bytes::from(vec![0u8; MAX_PCM_BYTES + 2]);
        assert!(matches!(
            AudioPacket::new("a", pcm),
            Err(PacketError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_connection_info_roundtrip() {
        let info = ConnectionInfo::new("10.0.0.5", 5000).unwrap();
        let mut buf = BytesMut::new();
        info.encode(&mut buf);

        let mut slice = &buf[..];
        let decoded = ConnectionInfo::decode(&mut slice).unwrap();
        assert_eq!(decoded, info);
        assert!(slice.is_empty());
    }

    #[test]
    fn test_connection_info_display_and_resolve() {
        let info = ConnectionInfo::new("127.0.0.1", 4000).unwrap();
        assert_eq!(info.to_string(), "127.0.0.1:4000");
        assert_eq!(info.resolve().unwrap(), "127.0.0.1:4000".parse().unwrap());

        let v6 = ConnectionInfo::from("[::1]:4000".parse::<SocketAddr>().unwrap());
        assert_eq!(v6.to_string(), "[::1]:4000");
    }

    #[test]
    fn test_overlong_fields_rejected_at_construction() {
        let long_address = "a".repeat(MAX_ADDRESS_LEN + 1);
        assert_eq!(
            ConnectionInfo::new(long_address, 1).unwrap_err(),
            PacketError::StringTooLong {
                len: MAX_ADDRESS_LEN + 1,
                max: MAX_ADDRESS_LEN
            }
        );

        let info = ConnectionInfo::new("a".repeat(MAX_ADDRESS_LEN), 1).unwrap();
        let long_id = "x".repeat(MAX_PLAYER_ID_LEN + 1);
        assert!(matches!(
            JoinPacket::new(long_id.clone(), info.clone()),
            Err(PacketError::StringTooLong { .. })
        ));
        assert!(matches!(
            AudioPacket::new(long_id, Bytes::new()),
            Err(PacketError::StringTooLong { .. })
        ));

        // Limits are inclusive and every constructible packet decodes
        let join = JoinPacket::new("x".repeat(MAX_PLAYER_ID_LEN), info).unwrap();
        let bytes = Packet::Join(join.clone()).to_bytes();
        assert_eq!(Packet::from_bytes(&bytes).unwrap(), Packet::Join(join));
    }

    #[test]
    fn test_connection_info_deserialize_validates() {
        let parsed: ConnectionInfo = toml::from_str("address = \"10.0.0.1\"\nport = 7000").unwrap();
        assert_eq!(parsed, ConnectionInfo::new("10.0.0.1", 7000).unwrap());

        let long = format!("address = \"{}\"\nport = 1", "a".repeat(MAX_ADDRESS_LEN + 1));
        assert!(toml::from_str::<ConnectionInfo>(&long).is_err());
    }

    #[test]
    fn test_packet_type_peek() {
        let bytes = Packet::Pong.to_bytes();
        assert_eq!(PacketType::peek(&bytes).unwrap(), PacketType::Pong);
        assert_eq!(PacketType::Audio.to_string(), "Audio");
    }
}
