//! Statistics formatting

use std::time::Duration;
use voice::DatagramStats;
use voice_io::ConnectionStats;
use voice_playback::BufferStats;

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format duration in human-readable form
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// One-line summary of a stream connection
pub fn format_connection_stats(stats: &ConnectionStats, uptime: Duration) -> String {
    format!(
        "[{}] TCP frames: {} sent / {} received | bytes: {} sent / {} received | reconnects: {}",
        format_duration(uptime),
        stats.frames_sent,
        stats.frames_received,
        format_bytes(stats.bytes_sent),
        format_bytes(stats.bytes_received),
        stats.reconnects
    )
}

/// One-line summary of a datagram endpoint
pub fn format_datagram_stats(stats: &DatagramStats, uptime: Duration) -> String {
    format!(
        "[{}] UDP datagrams: {} in / {} out | protocol errors: {} | malformed: {} | unknown peer sends: {}",
        format_duration(uptime),
        stats.datagrams_received,
        stats.datagrams_sent,
        stats.protocol_errors,
        stats.malformed,
        stats.unknown_peer_sends
    )
}

/// One-line summary of jitter buffer activity
pub fn format_buffer_stats(stats: &BufferStats) -> String {
    let offered = stats.accepted + stats.dropped;
    let drop_rate = if offered > 0 {
        stats.dropped as f64 * 100.0 / offered as f64
    } else {
        0.0
    };
    format!(
        "Playback frames: {} queued / {} dropped ({:.1}%) | slots reclaimed: {}",
        stats.accepted, stats.dropped, drop_rate, stats.reclaimed
    )
}
