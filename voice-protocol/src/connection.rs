//! Connection State Machine
//!
//! Tracks where a reliable connection is in its lifecycle. States only move
//! forward (`Connecting -> Probing -> Ready`), any state may fall to
//! `Disconnected`, and `Disconnected -> Connecting` starts a reconnect attempt.

use std::fmt;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Dialing the remote endpoint
    Connecting,
    /// Stream is open, readiness probe sent, waiting for the answer
    Probing,
    /// Peer answered the probe; audio may flow
    Ready,
    /// Not connected (initial state, after loss, or after a failed probe)
    #[default]
    Disconnected,
}

impl ConnectionState {
    /// Check whether moving from `self` to `next` is allowed
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Probing)
                | (Probing, Ready)
                | (_, Disconnected)
        )
    }

    /// Check if audio may be sent in this state
    pub fn is_ready(self) -> bool {
        self == ConnectionState::Ready
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Probing => "probing",
            ConnectionState::Ready => "ready",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}
