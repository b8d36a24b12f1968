//! Playback engine abstraction
//!
//! A [`PlaybackEngine`] is one positional output source with a queue of
//! engine-owned buffers ("slots"), in the style of OpenAL sources and
//! buffers. Slots are submitted in order, played in order, and reported back
//! as processed once finished; only processed slots may be reclaimed.
//!
//! [`MemoryEngine`] is a headless implementation driven by explicit
//! [`advance`](MemoryEngine::advance) calls, used by the client binary when no
//! audio device is present and by tests.

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::{Div, Sub};
use std::time::Duration;
use thiserror::Error;
use voice_protocol::AudioFormat;

/// Engine-assigned buffer handle
pub type SlotId = u32;

/// Engine errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Unknown slot {0}")]
    UnknownSlot(SlotId),

    #[error("Slot {0} is still queued on the source")]
    SlotInUse(SlotId),

    #[error("Cannot reclaim {requested} slots, only {processed} processed")]
    NotProcessed { requested: usize, processed: usize },

    #[error("Reclaim out of order: expected slot {expected}, got {got}")]
    OutOfOrder { expected: SlotId, got: SlotId },

    #[error("Unsupported format: {0:?}")]
    UnsupportedFormat(AudioFormat),

    #[error("Engine failure: {0}")]
    Backend(String),
}

/// Playback state of the engine source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceState {
    #[default]
    Initial,
    Playing,
    Paused,
    Stopped,
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceState::Initial => write!(f, "Initial"),
            SourceState::Playing => write!(f, "Playing"),
            SourceState::Paused => write!(f, "Paused"),
            SourceState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Point or vector in listener space
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Vec3 { x, y, z }
    }

    pub fn length(self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Unit vector in the same direction, or zero for a zero vector
    pub fn normalized(self) -> Vec3 {
        let len = self.length();
        if len <= f32::EPSILON {
            Vec3::ZERO
        } else {
            self / len
        }
    }
}

impl Sub for Vec3 {
    type Output = Vec3;

    fn sub(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Div<f32> for Vec3 {
    type Output = Vec3;

    fn div(self, rhs: f32) -> Vec3 {
        Vec3::new(self.x / rhs, self.y / rhs, self.z / rhs)
    }
}

/// Spatial parameters applied to a source
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SpatialParams {
    pub position: Vec3,
    pub velocity: Vec3,
    pub direction: Vec3,
}

impl SpatialParams {
    /// Parameters pinning a non-locational source onto the listener
    pub fn at_listener(listener: Vec3) -> Self {
        SpatialParams {
            position: listener,
            velocity: Vec3::ZERO,
            direction: Vec3::ZERO,
        }
    }
}

/// Primitives of a positional audio output source
pub trait PlaybackEngine {
    /// Create `count` slots owned by this source
    fn allocate_slots(&mut self, count: usize) -> Result<Vec<SlotId>, EngineError>;

    /// Load `pcm` into `slot` and append it to the play queue
    fn submit(&mut self, slot: SlotId, pcm: &[u8], format: AudioFormat) -> Result<(), EngineError>;

    /// Number of slots at the front of the play queue that finished playing
    fn processed_count(&self) -> usize;

    /// Remove finished slots from the front of the play queue, oldest first
    fn reclaim(&mut self, slots: &[SlotId]) -> Result<(), EngineError>;

    /// Current playback state
    fn state(&self) -> SourceState;

    fn play(&mut self) -> Result<(), EngineError>;

    /// Halt playback; every queued slot counts as processed afterwards
    fn stop(&mut self) -> Result<(), EngineError>;

    /// Destroy slots that are no longer queued
    fn release_slots(&mut self, slots: &[SlotId]) -> Result<(), EngineError>;

    fn set_spatial(&mut self, params: &SpatialParams) -> Result<(), EngineError>;

    /// Position of the listener the source is rendered for
    fn listener_position(&self) -> Vec3;
}

struct LoadedSlot {
    pcm: Bytes,
    duration: Duration,
}

/// Headless playback engine
///
/// Playing a slot appends its PCM to an output log that can be collected with
/// [`take_played`](MemoryEngine::take_played). When the last queued slot has
/// played, the source stops on its own, as a real device does when starved.
#[derive(Default)]
pub struct MemoryEngine {
    slots: HashMap<SlotId, Option<LoadedSlot>>,
    queue: VecDeque<SlotId>,
    processed: usize,
    state: SourceState,
    next_id: SlotId,
    credit: Duration,
    played: Vec<Bytes>,
    spatial: Option<SpatialParams>,
    listener: Vec3,
    play_calls: u64,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Play up to `frames` queued slots, returning how many played
    pub fn advance(&mut self, frames: usize) -> usize {
        let mut played = 0;
        while played < frames && self.play_next().is_some() {
            played += 1;
        }
        played
    }

    /// Play as many queued slots as fit into `elapsed` of wall time
    ///
    /// Leftover time is carried into the next call so frame boundaries do not
    /// need to line up with the caller's tick.
    pub fn advance_by(&mut self, elapsed: Duration) -> usize {
        if self.state != SourceState::Playing {
            self.credit = Duration::ZERO;
            return 0;
        }
        self.credit += elapsed;

        let mut played = 0;
        while let Some(duration) = self.next_duration() {
            if duration > self.credit {
                break;
            }
            self.credit -= duration;
            if self.play_next().is_none() {
                break;
            }
            played += 1;
        }
        if self.state != SourceState::Playing {
            self.credit = Duration::ZERO;
        }
        played
    }

    /// Stop the source without consuming queued slots, as a device
    /// underrun or focus loss does
    pub fn interrupt(&mut self) {
        self.state = SourceState::Stopped;
        self.credit = Duration::ZERO;
    }

    /// Drain the PCM played so far
    pub fn take_played(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.played)
    }

    /// Slots currently on the play queue (processed or not)
    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Slots that exist and have not been released
    pub fn allocated_len(&self) -> usize {
        self.slots.len()
    }

    /// Number of times [`play`](PlaybackEngine::play) was issued
    pub fn play_calls(&self) -> u64 {
        self.play_calls
    }

    /// Last spatial parameters applied
    pub fn spatial(&self) -> Option<SpatialParams> {
        self.spatial
    }

    pub fn set_listener_position(&mut self, position: Vec3) {
        self.listener = position;
    }

    fn next_duration(&self) -> Option<Duration> {
        let slot = self.queue.get(self.processed)?;
        self.slots
            .get(slot)
            .and_then(|loaded| loaded.as_ref())
            .map(|loaded| loaded.duration)
    }

    fn play_next(&mut self) -> Option<SlotId> {
        if self.state != SourceState::Playing {
            return None;
        }
        let Some(&slot) = self.queue.get(self.processed) else {
            self.state = SourceState::Stopped;
            return None;
        };

        if let Some(Some(loaded)) = self.slots.get(&slot) {
            self.played.push(loaded.pcm.clone());
        }
        self.processed += 1;
        if self.processed == self.queue.len() {
            self.state = SourceState::Stopped;
        }
        Some(slot)
    }
}

impl PlaybackEngine for MemoryEngine {
    fn allocate_slots(&mut self, count: usize) -> Result<Vec<SlotId>, EngineError> {
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            self.next_id += 1;
            self.slots.insert(self.next_id, None);
            ids.push(self.next_id);
        }
        Ok(ids)
    }

    fn submit(&mut self, slot: SlotId, pcm: &[u8], format: AudioFormat) -> Result<(), EngineError> {
        if format.block_align() == 0 || format.sample_rate == 0 {
            return Err(EngineError::UnsupportedFormat(format));
        }
        if self.queue.contains(&slot) {
            return Err(EngineError::SlotInUse(slot));
        }
        let entry = self.slots.get_mut(&slot).ok_or(EngineError::UnknownSlot(slot))?;
        *entry = Some(LoadedSlot {
            pcm: Bytes::copy_from_slice(pcm),
            duration: format.duration_of(pcm.len()),
        });
        self.queue.push_back(slot);
        Ok(())
    }

    fn processed_count(&self) -> usize {
        self.processed
    }

    fn reclaim(&mut self, slots: &[SlotId]) -> Result<(), EngineError> {
        if slots.len() > self.processed {
            return Err(EngineError::NotProcessed {
                requested: slots.len(),
                processed: self.processed,
            });
        }
        for (expected, &got) in self.queue.iter().zip(slots) {
            if *expected != got {
                return Err(EngineError::OutOfOrder {
                    expected: *expected,
                    got,
                });
            }
        }
        self.queue.drain(..slots.len());
        self.processed -= slots.len();
        Ok(())
    }

    fn state(&self) -> SourceState {
        self.state
    }

    fn play(&mut self) -> Result<(), EngineError> {
        self.play_calls += 1;
        self.state = SourceState::Playing;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), EngineError> {
        self.state = SourceState::Stopped;
        self.processed = self.queue.len();
        self.credit = Duration::ZERO;
        Ok(())
    }

    fn release_slots(&mut self, slots: &[SlotId]) -> Result<(), EngineError> {
        for slot in slots {
            if self.queue.contains(slot) {
                return Err(EngineError::SlotInUse(*slot));
            }
            if !self.slots.contains_key(slot) {
                return Err(EngineError::UnknownSlot(*slot));
            }
        }
        for slot in slots {
            self.slots.remove(slot);
        }
        Ok(())
    }

    fn set_spatial(&mut self, params: &SpatialParams) -> Result<(), EngineError> {
        self.spatial = Some(*params);
        Ok(())
    }

    fn listener_position(&self) -> Vec3 {
        self.listener
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FORMAT: AudioFormat = AudioFormat::MONO16_48K;

    fn frame(value: u8) -> Vec<u8> {
        // 20 ms at 48 kHz mono 16-bit
        vec![value; 1920]
    }

    #[test]
    fn test_play_in_submission_order() {
        let mut engine = MemoryEngine::new();
        let slots = engine.allocate_slots(3).unwrap();
        for (i, slot) in slots.iter().enumerate() {
            engine.submit(*slot, &frame(i as u8), FORMAT).unwrap();
        }
        engine.play().unwrap();

        assert_eq!(engine.advance(2), 2);
        assert_eq!(engine.processed_count(), 2);
        let played = engine.take_played();
        assert_eq!(played[0][0], 0);
        assert_eq!(played[1][0], 1);
    }

    #[test]
    fn test_starved_source_stops() {
        let mut engine = MemoryEngine::new();
        let slots = engine.allocate_slots(1).unwrap();
        engine.submit(slots[0], &frame(7), FORMAT).unwrap();
        engine.play().unwrap();

        assert_eq!(engine.advance(5), 1);
        assert_eq!(engine.state(), SourceState::Stopped);
    }

    #[test]
    fn test_reclaim_requires_processed_front() {
        let mut engine = MemoryEngine::new();
        let slots = engine.allocate_slots(2).unwrap();
        engine.submit(slots[0], &frame(0), FORMAT).unwrap();
        engine.submit(slots[1], &frame(1), FORMAT).unwrap();

        assert!(matches!(
            engine.reclaim(&slots[..1]),
            Err(EngineError::NotProcessed { .. })
        ));

        engine.play().unwrap();
        engine.advance(1);
        assert!(matches!(
            engine.reclaim(&slots[1..]),
            Err(EngineError::OutOfOrder { .. })
        ));
        engine.reclaim(&slots[..1]).unwrap();
        assert_eq!(engine.queued_len(), 1);
        assert_eq!(engine.processed_count(), 0);
    }

    #[test]
    fn test_stop_marks_all_processed() {
        let mut engine = MemoryEngine::new();
        let slots = engine.allocate_slots(2).unwrap();
        engine.submit(slots[0], &frame(0), FORMAT).unwrap();
        engine.submit(slots[1], &frame(1), FORMAT).unwrap();
        engine.stop().unwrap();

        assert_eq!(engine.processed_count(), 2);
        engine.reclaim(&slots).unwrap();
        engine.release_slots(&slots).unwrap();
        assert_eq!(engine.allocated_len(), 0);
    }

    #[test]
    fn test_release_queued_slot_rejected() {
        let mut engine = MemoryEngine::new();
        let slots = engine.allocate_slots(1).unwrap();
        engine.submit(slots[0], &frame(0), FORMAT).unwrap();
        assert_eq!(
            engine.release_slots(&slots),
            Err(EngineError::SlotInUse(slots[0]))
        );
    }

    #[test]
    fn test_advance_by_carries_credit() {
        let mut engine = MemoryEngine::new();
        let slots = engine.allocate_slots(3).unwrap();
        for slot in &slots {
            engine.submit(*slot, &frame(0), FORMAT).unwrap();
        }
        engine.play().unwrap();

        assert_eq!(engine.advance_by(Duration::from_millis(15)), 0);
        assert_eq!(engine.advance_by(Duration::from_millis(10)), 1);
        assert_eq!(engine.advance_by(Duration::from_millis(35)), 2);
        assert_eq!(engine.state(), SourceState::Stopped);
    }

    #[test]
    fn test_vec3_normalized() {
        let v = Vec3::new(3.0, 0.0, 4.0).normalized();
        assert!((v.length() - 1.0).abs() < 1e-6);
        assert_eq!(Vec3::ZERO.normalized(), Vec3::ZERO);
    }
}
