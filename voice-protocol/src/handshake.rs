//! Readiness Handshake
//!
//! After the stream is open the client sends a Ping and blocks until the peer
//! answers with a Pong or the bounded wait elapses. The probe owns the
//! connection state so that the Pong arriving on the receive thread and the
//! timeout observed by the waiting thread are decided under one lock: a Pong
//! accepted before the waiter re-acquires the lock counts as success, and a
//! Pong arriving after the timeout was recorded is ignored.

use crate::connection::ConnectionState;
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Default bound on the readiness wait
pub const READINESS_TIMEOUT: Duration = Duration::from_secs(5);

/// Handshake errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Peer did not answer readiness probe within {0:?}")]
    ReadinessTimeout(Duration),

    #[error("Readiness probe aborted: connection closed while probing")]
    Aborted,

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
}

struct ProbeState {
    state: ConnectionState,
    ready_transitions: u64,
}

/// Readiness probe and connection state holder
pub struct ReadinessProbe {
    inner: Mutex<ProbeState>,
    changed: Condvar,
    timeout: Duration,
}

impl ReadinessProbe {
    /// Create a probe with the given wait bound
    pub fn new(timeout: Duration) -> Self {
        ReadinessProbe {
            inner: Mutex::new(ProbeState {
                state: ConnectionState::Disconnected,
                ready_transitions: 0,
            }),
            changed: Condvar::new(),
            timeout,
        }
    }

    /// Get the wait bound
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Check if the connection passed the probe
    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    /// Number of times the probe has reached `Ready` (once per successful handshake)
    pub fn ready_transitions(&self) -> u64 {
        self.inner.lock().ready_transitions
    }

    /// Enter `Connecting` before dialing
    pub fn begin_connect(&self) -> Result<(), HandshakeError> {
        self.transition(ConnectionState::Connecting)
    }

    /// Enter `Probing`; the caller sends the Ping right after
    pub fn begin_probe(&self) -> Result<(), HandshakeError> {
        self.transition(ConnectionState::Probing)
    }

    /// Record a Pong from the peer
    ///
    /// Returns true if this Pong completed the handshake. Pongs received in
    /// any state other than `Probing` (duplicates, late answers) are ignored.
    pub fn accept_pong(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != ConnectionState::Probing {
            tracing::debug!("Ignoring Pong in state {}", inner.state);
            return false;
        }
        inner.state = ConnectionState::Ready;
        inner.ready_transitions += 1;
        self.changed.notify_all();
        true
    }

    /// Block until the peer answers or the wait bound elapses
    ///
    /// On timeout the state is set to `Disconnected` before returning, so no
    /// ready state survives a failed probe.
    pub fn wait_ready(&self) -> Result<(), HandshakeError> {
        let deadline = Instant::now() + self.timeout;
        let mut inner = self.inner.lock();

        while inner.state == ConnectionState::Probing {
            if self.changed.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }

        match inner.state {
            ConnectionState::Ready => Ok(()),
            ConnectionState::Probing => {
                inner.state = ConnectionState::Disconnected;
                self.changed.notify_all();
                Err(HandshakeError::ReadinessTimeout(self.timeout))
            }
            _ => Err(HandshakeError::Aborted),
        }
    }

    /// Drop to `Disconnected`, waking any thread blocked in [`wait_ready`](Self::wait_ready)
    pub fn mark_disconnected(&self) {
        let mut inner = self.inner.lock();
        inner.state = ConnectionState::Disconnected;
        self.changed.notify_all();
    }

    fn transition(&self, next: ConnectionState) -> Result<(), HandshakeError> {
        let mut inner = self.inner.lock();
        if !inner.state.can_transition_to(next) {
            return Err(HandshakeError::InvalidTransition {
                from: inner.state,
                to: next,
            });
        }
        inner.state = next;
        self.changed.notify_all();
        Ok(())
    }
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        ReadinessProbe::new(READINESS_TIMEOUT)
    }
}
