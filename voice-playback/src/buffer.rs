//! Circular audio buffer
//!
//! A fixed pool of engine slots split between an `available` queue and a
//! `queued` queue (submission order). A slot is in exactly one of the two
//! until disposal, so `available + queued == capacity` always holds.
//!
//! When every slot is in flight the incoming frame is dropped; queued audio
//! is never overwritten. Falling behind therefore costs fresh frames, not
//! the audio the listener is already hearing.

use crate::engine::{EngineError, PlaybackEngine, SlotId};
use std::collections::VecDeque;
use thiserror::Error;
use tracing::Span;
use voice_protocol::AudioFormat;

/// Slots per remote player
pub const DEFAULT_SLOTS: usize = 4;

/// Buffer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("Buffer capacity must be at least one slot")]
    ZeroCapacity,

    #[error("Engine allocated {allocated} slots, requested {requested}")]
    ShortAllocation { requested: usize, allocated: usize },

    #[error("Buffer has been disposed")]
    Disposed,

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Result of offering a frame to the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Frame was loaded into the slot and submitted to the engine
    Queued(SlotId),
    /// No slot was free; the frame was discarded
    Dropped,
}

impl EnqueueOutcome {
    pub fn is_dropped(self) -> bool {
        matches!(self, EnqueueOutcome::Dropped)
    }
}

/// Buffer statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Frames submitted to the engine
    pub accepted: u64,
    /// Frames dropped for lack of a free slot
    pub dropped: u64,
    /// Slots returned from the engine after playing
    pub reclaimed: u64,
}

/// Circular jitter buffer over engine slots
pub struct CircularAudioBuffer {
    slots: Vec<SlotId>,
    available: VecDeque<SlotId>,
    queued: VecDeque<SlotId>,
    format: AudioFormat,
    stats: BufferStats,
    disposed: bool,
    span: Span,
}

impl CircularAudioBuffer {
    /// Allocate `capacity` slots on `engine`
    pub fn new<E: PlaybackEngine + ?Sized>(
        engine: &mut E,
        capacity: usize,
        format: AudioFormat,
        span: Span,
    ) -> Result<Self, BufferError> {
        if capacity == 0 {
            return Err(BufferError::ZeroCapacity);
        }

        let slots = engine.allocate_slots(capacity)?;
        if slots.len() != capacity {
            let allocated = slots.len();
            let _ = engine.release_slots(&slots);
            return Err(BufferError::ShortAllocation {
                requested: capacity,
                allocated,
            });
        }

        Ok(CircularAudioBuffer {
            available: slots.iter().copied().collect(),
            queued: VecDeque::with_capacity(capacity),
            slots,
            format,
            stats: BufferStats::default(),
            disposed: false,
            span,
        })
    }

    /// Offer one frame of PCM
    ///
    /// Returns [`EnqueueOutcome::Dropped`] without touching the engine when
    /// every slot is still in flight.
    pub fn enqueue<E: PlaybackEngine + ?Sized>(
        &mut self,
        engine: &mut E,
        pcm: &[u8],
    ) -> Result<EnqueueOutcome, BufferError> {
        if self.disposed {
            return Err(BufferError::Disposed);
        }

        let Some(slot) = self.available.pop_front() else {
            self.stats.dropped += 1;
            let _enter = self.span.enter();
            tracing::debug!(
                "Jitter buffer full ({} slots in flight), dropping {} byte frame",
                self.queued.len(),
                pcm.len()
            );
            return Ok(EnqueueOutcome::Dropped);
        };

        if let Err(e) = engine.submit(slot, pcm, self.format) {
            self.available.push_front(slot);
            return Err(e.into());
        }

        self.queued.push_back(slot);
        self.stats.accepted += 1;
        Ok(EnqueueOutcome::Queued(slot))
    }

    /// Return finished slots to the available queue
    ///
    /// Moves exactly as many slots as the engine reports processed, oldest
    /// first. Returns the number of slots reclaimed.
    pub fn drain_completed<E: PlaybackEngine + ?Sized>(
        &mut self,
        engine: &mut E,
    ) -> Result<usize, BufferError> {
        if self.disposed {
            return Err(BufferError::Disposed);
        }

        let processed = engine.processed_count().min(self.queued.len());
        if processed == 0 {
            return Ok(0);
        }

        let finished: Vec<SlotId> = self.queued.iter().take(processed).copied().collect();
        engine.reclaim(&finished)?;
        self.queued.drain(..processed);
        self.available.extend(finished);
        self.stats.reclaimed += processed as u64;
        Ok(processed)
    }

    /// Stop the engine and return every slot to the available queue
    pub fn reset<E: PlaybackEngine + ?Sized>(&mut self, engine: &mut E) -> Result<(), BufferError> {
        engine.stop()?;
        self.drain_completed(engine)?;
        Ok(())
    }

    /// Release every slot back to the engine
    ///
    /// Idempotent. Engine failures during teardown are logged and otherwise
    /// ignored.
    pub fn dispose<E: PlaybackEngine + ?Sized>(&mut self, engine: &mut E) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        let _enter = self.span.enter();

        if !self.queued.is_empty() {
            let queued: Vec<SlotId> = self.queued.drain(..).collect();
            if let Err(e) = engine.stop().and_then(|_| engine.reclaim(&queued)) {
                tracing::debug!("Failed to unqueue slots during dispose: {}", e);
            }
        }
        self.available.clear();

        if let Err(e) = engine.release_slots(&self.slots) {
            tracing::debug!("Failed to release slots during dispose: {}", e);
        }
        self.slots.clear();
    }

    /// Total number of slots
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Free slots
    pub fn available_len(&self) -> usize {
        self.available.len()
    }

    /// Slots submitted and not yet reclaimed
    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    /// Slots in flight, oldest first
    pub fn queued_slots(&self) -> impl Iterator<Item = SlotId> + '_ {
        self.queued.iter().copied()
    }

    /// Check if the next frame would be dropped
    pub fn is_full(&self) -> bool {
        self.available.is_empty()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Get buffer statistics
    pub fn stats(&self) -> BufferStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;

    fn setup(capacity: usize) -> (MemoryEngine, CircularAudioBuffer) {
        let mut engine = MemoryEngine::new();
        let buffer =
            CircularAudioBuffer::new(&mut engine, capacity, AudioFormat::MONO16_48K, Span::none())
                .unwrap();
        (engine, buffer)
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut engine = MemoryEngine::new();
        let result =
            CircularAudioBuffer::new(&mut engine, 0, AudioFormat::MONO16_48K, Span::none());
        assert_eq!(result.err(), Some(BufferError::ZeroCapacity));
    }

    #[test]
    fn test_full_buffer_drops() {
        let (mut engine, mut buffer) = setup(DEFAULT_SLOTS);
        for _ in 0..DEFAULT_SLOTS {
            assert!(!buffer.enqueue(&mut engine, &[0; 4]).unwrap().is_dropped());
        }
        assert!(buffer.is_full());

        assert_eq!(buffer.enqueue(&mut engine, &[1; 4]).unwrap(), EnqueueOutcome::Dropped);
        assert_eq!(buffer.queued_len(), DEFAULT_SLOTS);
        assert_eq!(engine.queued_len(), DEFAULT_SLOTS);
        assert_eq!(buffer.stats().dropped, 1);
        assert_eq!(buffer.stats().accepted, DEFAULT_SLOTS as u64);
    }

    #[test]
    fn test_drain_reuses_in_fifo_order() {
        let (mut engine, mut buffer) = setup(3);
        let mut submitted = Vec::new();
        for _ in 0..3 {
            match buffer.enqueue(&mut engine, &[0; 4]).unwrap() {
                EnqueueOutcome::Queued(slot) => submitted.push(slot),
                EnqueueOutcome::Dropped => panic!("unexpected drop"),
            }
        }

        engine.play().unwrap();
        engine.advance(2);
        assert_eq!(buffer.drain_completed(&mut engine).unwrap(), 2);
        assert_eq!(buffer.available_len(), 2);

        let first = buffer.enqueue(&mut engine, &[0; 4]).unwrap();
        let second = buffer.enqueue(&mut engine, &[0; 4]).unwrap();
        assert_eq!(first, EnqueueOutcome::Queued(submitted[0]));
        assert_eq!(second, EnqueueOutcome::Queued(submitted[1]));
    }

    #[test]
    fn test_drain_without_progress_is_noop() {
        let (mut engine, mut buffer) = setup(2);
        buffer.enqueue(&mut engine, &[0; 4]).unwrap();
        assert_eq!(buffer.drain_completed(&mut engine).unwrap(), 0);
        assert_eq!(buffer.queued_len(), 1);
    }

    #[test]
    fn test_reset_returns_all_slots() {
        let (mut engine, mut buffer) = setup(4);
        buffer.enqueue(&mut engine, &[0; 4]).unwrap();
        buffer.enqueue(&mut engine, &[0; 4]).unwrap();

        buffer.reset(&mut engine).unwrap();
        assert_eq!(buffer.available_len(), 4);
        assert_eq!(buffer.queued_len(), 0);
        assert_eq!(engine.queued_len(), 0);
    }

    #[test]
    fn test_dispose_releases_everything() {
        let (mut engine, mut buffer) = setup(4);
        buffer.enqueue(&mut engine, &[0; 4]).unwrap();

        buffer.dispose(&mut engine);
        assert_eq!(engine.allocated_len(), 0);
        assert_eq!(buffer.capacity(), 0);

        // Second dispose is a no-op
        buffer.dispose(&mut engine);
        assert_eq!(buffer.enqueue(&mut engine, &[0; 4]), Err(BufferError::Disposed));
    }

    #[test]
    fn test_failed_submit_keeps_slot() {
        let (mut engine, mut buffer) = setup(1);
        // Zero sample rate is rejected at submit
        let mut bad = CircularAudioBuffer::new(
            &mut engine,
            1,
            AudioFormat {
                sample_rate: 0,
                channels: 1,
                bits_per_sample: 16,
            },
            Span::none(),
        )
        .unwrap();
        assert!(bad.enqueue(&mut engine, &[0; 4]).is_err());
        assert_eq!(bad.available_len(), 1);

        assert!(!buffer.enqueue(&mut engine, &[0; 4]).unwrap().is_dropped());
    }
}
