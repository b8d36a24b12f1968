//! Per-player playback scheduler
//!
//! Owns one engine source and its jitter buffer for a remote player:
//!
//! ```text
//! Idle --start()--> Buffering --first frame--> Playing --stop()--> Idle
//! ```
//!
//! Frames offered while `Idle` are discarded. While `Playing`, a source the
//! engine stopped on its own (starved queue) is restarted as soon as audio is
//! queued again, keeping the slots and statistics it already had.

use crate::buffer::{BufferError, BufferStats, CircularAudioBuffer, EnqueueOutcome};
use crate::engine::{EngineError, PlaybackEngine, SourceState, SpatialParams, Vec3};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::Span;
use voice_io::Timer;
use voice_protocol::AudioFormat;

/// Default spatial refresh period while playing
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(100);

/// Scheduler errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),
}

/// Positions of a speaking player and the local listener
pub trait SpatialSource: Send {
    /// Current position of the speaker, `None` if the player is not locational
    fn speaker_position(&self) -> Option<Vec3>;

    fn listener_position(&self) -> Vec3;
}

/// Scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerState {
    #[default]
    Idle,
    /// Eligible for playback, waiting for the first frame
    Buffering,
    Playing,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerState::Idle => write!(f, "Idle"),
            SchedulerState::Buffering => write!(f, "Buffering"),
            SchedulerState::Playing => write!(f, "Playing"),
        }
    }
}

/// What happened to a frame offered to the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Submitted to the engine
    Queued,
    /// Discarded because the jitter buffer was full
    Dropped,
    /// Discarded because the player is not playing
    Ignored,
}

/// Playback scheduler for one remote player
pub struct PlaybackScheduler<E: PlaybackEngine> {
    player_id: String,
    engine: E,
    buffer: CircularAudioBuffer,
    state: SchedulerState,
    refresh: Option<Timer>,
    refresh_interval: Duration,
    spatial: Option<Box<dyn SpatialSource>>,
    last_position: Option<Vec3>,
    restarts: u64,
    span: Span,
}

impl<E: PlaybackEngine> PlaybackScheduler<E> {
    /// Create an idle scheduler with `slots` jitter buffer slots on `engine`
    pub fn new(
        player_id: impl Into<String>,
        mut engine: E,
        slots: usize,
        refresh_interval: Duration,
        span: Span,
    ) -> Result<Self, SchedulerError> {
        let buffer =
            CircularAudioBuffer::new(&mut engine, slots, AudioFormat::MONO16_48K, span.clone())?;

        Ok(PlaybackScheduler {
            player_id: player_id.into(),
            engine,
            buffer,
            state: SchedulerState::Idle,
            refresh: None,
            refresh_interval,
            spatial: None,
            last_position: None,
            restarts: 0,
            span,
        })
    }

    /// Attach the source of speaker and listener positions
    pub fn with_spatial(mut self, source: Box<dyn SpatialSource>) -> Self {
        self.spatial = Some(source);
        self
    }

    /// Make the player eligible for playback and schedule spatial refresh
    pub fn start(&mut self) {
        if self.state != SchedulerState::Idle {
            return;
        }
        self.state = SchedulerState::Buffering;
        self.refresh = Some(Timer::new(self.refresh_interval));

        let _enter = self.span.enter();
        tracing::debug!("Player {} eligible for playback", self.player_id);
    }

    /// Offer one received frame
    pub fn enqueue_incoming(&mut self, pcm: &[u8]) -> Result<Delivery, SchedulerError> {
        if self.state == SchedulerState::Idle {
            let _enter = self.span.enter();
            tracing::trace!("Player {} not playing, ignoring frame", self.player_id);
            return Ok(Delivery::Ignored);
        }

        self.buffer.drain_completed(&mut self.engine)?;
        let outcome = self.buffer.enqueue(&mut self.engine, pcm)?;

        match self.state {
            SchedulerState::Buffering if !outcome.is_dropped() => {
                self.engine.play()?;
                self.state = SchedulerState::Playing;
                let _enter = self.span.enter();
                tracing::info!("Player {} started playing", self.player_id);
            }
            SchedulerState::Playing => self.resume_if_starved()?,
            _ => {}
        }

        Ok(match outcome {
            EnqueueOutcome::Queued(_) => Delivery::Queued,
            EnqueueOutcome::Dropped => Delivery::Dropped,
        })
    }

    /// Periodic maintenance: reclaim finished slots, refresh spatial
    /// parameters when due, and restart a starved source
    pub fn tick(&mut self) -> Result<(), SchedulerError> {
        if self.state == SchedulerState::Idle {
            return Ok(());
        }

        self.buffer.drain_completed(&mut self.engine)?;

        let fired = self.refresh.as_mut().and_then(Timer::try_fire);
        if let Some(elapsed) = fired {
            self.refresh_spatial(elapsed)?;
        }

        if self.state == SchedulerState::Playing {
            self.resume_if_starved()?;
        }
        Ok(())
    }

    /// Return to `Idle`, halting refresh and clearing queued audio
    pub fn stop(&mut self) -> Result<(), SchedulerError> {
        let was = self.state;
        self.state = SchedulerState::Idle;
        self.refresh = None;
        self.last_position = None;
        self.buffer.reset(&mut self.engine)?;

        if was != SchedulerState::Idle {
            let _enter = self.span.enter();
            tracing::info!("Player {} stopped", self.player_id);
        }
        Ok(())
    }

    pub fn player_id(&self) -> &str {
        &self.player_id
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn buffer(&self) -> &CircularAudioBuffer {
        &self.buffer
    }

    /// Check if spatial refresh is scheduled
    pub fn is_refresh_scheduled(&self) -> bool {
        self.refresh.is_some()
    }

    /// Number of times a starved source was restarted
    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    pub fn stats(&self) -> BufferStats {
        self.buffer.stats()
    }

    /// Re-issue play on a source that stopped under a `Playing` scheduler
    ///
    /// An empty source is restarted too, so the next submitted frame plays
    /// without waiting for another start.
    fn resume_if_starved(&mut self) -> Result<(), SchedulerError> {
        if self.engine.state() == SourceState::Playing {
            return Ok(());
        }
        self.engine.play()?;
        self.restarts += 1;

        let _enter = self.span.enter();
        tracing::debug!(
            "Restarted playback for player {} ({} frames queued)",
            self.player_id,
            self.buffer.queued_len()
        );
        Ok(())
    }

    fn refresh_spatial(&mut self, elapsed: Duration) -> Result<(), SchedulerError> {
        let Some(source) = self.spatial.as_ref() else {
            return Ok(());
        };

        let params = match source.speaker_position() {
            Some(position) => {
                let direction = (position - source.listener_position()).normalized();
                let seconds = elapsed.as_secs_f32();
                let velocity = match self.last_position {
                    Some(last) if seconds > 0.0 => (position - last) / seconds,
                    _ => Vec3::ZERO,
                };
                self.last_position = Some(position);
                SpatialParams {
                    position,
                    velocity,
                    direction,
                }
            }
            None => {
                self.last_position = None;
                SpatialParams::at_listener(self.engine.listener_position())
            }
        };

        self.engine.set_spatial(&params)?;
        Ok(())
    }
}

impl<E: PlaybackEngine> Drop for PlaybackScheduler<E> {
    fn drop(&mut self) {
        self.buffer.dispose(&mut self.engine);
    }
}
