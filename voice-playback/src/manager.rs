//! Playback manager
//!
//! Owns one [`PlaybackScheduler`] per remote player on the playback thread.
//! Network threads reach it through a [`TaskSender`](crate::TaskSender) whose
//! tasks receive `&mut PlaybackManager`.

use crate::buffer::{BufferStats, DEFAULT_SLOTS};
use crate::engine::{EngineError, PlaybackEngine};
use crate::scheduler::{Delivery, PlaybackScheduler, SchedulerError, DEFAULT_REFRESH_INTERVAL};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::Span;

/// Manager errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManagerError {
    #[error("Player already has a playback source: {0}")]
    DuplicatePlayer(String),

    #[error("Failed to create playback source: {0}")]
    Engine(#[from] EngineError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// Per-player playback settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackConfig {
    /// Jitter buffer slots per player
    pub slots: usize,
    /// Spatial refresh period
    pub refresh_interval: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        PlaybackConfig {
            slots: DEFAULT_SLOTS,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }
}

/// Schedulers for every remote player
pub struct PlaybackManager<E, F>
where
    E: PlaybackEngine,
    F: FnMut(&str) -> Result<E, EngineError>,
{
    players: HashMap<String, PlaybackScheduler<E>>,
    factory: F,
    config: PlaybackConfig,
    span: Span,
}

impl<E, F> PlaybackManager<E, F>
where
    E: PlaybackEngine,
    F: FnMut(&str) -> Result<E, EngineError>,
{
    /// Create a manager building one engine source per player with `factory`
    pub fn new(factory: F, config: PlaybackConfig, span: Span) -> Self {
        PlaybackManager {
            players: HashMap::new(),
            factory,
            config,
            span,
        }
    }

    /// Create and start a scheduler for `player_id`
    pub fn add_player(&mut self, player_id: &str) -> Result<&mut PlaybackScheduler<E>, ManagerError> {
        if self.players.contains_key(player_id) {
            return Err(ManagerError::DuplicatePlayer(player_id.to_string()));
        }

        let engine = (self.factory)(player_id)?;
        let mut scheduler = PlaybackScheduler::new(
            player_id,
            engine,
            self.config.slots,
            self.config.refresh_interval,
            self.span.clone(),
        )?;
        scheduler.start();

        let _enter = self.span.enter();
        tracing::info!("Added playback source for player {}", player_id);
        Ok(self.players.entry(player_id.to_string()).or_insert(scheduler))
    }

    /// Stop and dispose the scheduler for `player_id`
    pub fn remove_player(&mut self, player_id: &str) -> bool {
        let Some(mut scheduler) = self.players.remove(player_id) else {
            return false;
        };
        let _enter = self.span.enter();
        if let Err(e) = scheduler.stop() {
            tracing::debug!("Error stopping player {}: {}", player_id, e);
        }
        tracing::info!("Removed playback source for player {}", player_id);
        true
    }

    /// Route a received frame to its player's scheduler
    ///
    /// A frame from a player without a source creates and starts one.
    pub fn enqueue_incoming(&mut self, player_id: &str, pcm: &[u8]) -> Result<Delivery, ManagerError> {
        if let Some(scheduler) = self.players.get_mut(player_id) {
            return Ok(scheduler.enqueue_incoming(pcm)?);
        }
        let scheduler = self.add_player(player_id)?;
        Ok(scheduler.enqueue_incoming(pcm)?)
    }

    /// Tick every scheduler; failures are logged per player
    pub fn tick(&mut self) {
        let _enter = self.span.enter();
        for (player_id, scheduler) in self.players.iter_mut() {
            if let Err(e) = scheduler.tick() {
                tracing::warn!("Playback tick failed for player {}: {}", player_id, e);
            }
        }
    }

    pub fn get(&self, player_id: &str) -> Option<&PlaybackScheduler<E>> {
        self.players.get(player_id)
    }

    pub fn get_mut(&mut self, player_id: &str) -> Option<&mut PlaybackScheduler<E>> {
        self.players.get_mut(player_id)
    }

    pub fn players(&self) -> impl Iterator<Item = &str> {
        self.players.keys().map(String::as_str)
    }

    pub fn schedulers_mut(&mut self) -> impl Iterator<Item = &mut PlaybackScheduler<E>> {
        self.players.values_mut()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Buffer statistics summed over all players
    pub fn stats(&self) -> BufferStats {
        self.players
            .values()
            .map(PlaybackScheduler::stats)
            .fold(BufferStats::default(), |mut total, stats| {
                total.accepted += stats.accepted;
                total.dropped += stats.dropped;
                total.reclaimed += stats.reclaimed;
                total
            })
    }
}
