//! Property-based tests for the jitter buffer and playback scheduler
//!
//! Random interleavings of arriving frames, engine progress and scheduler
//! ticks must never put more than the slot count in flight, must drop only
//! when every slot is busy, and must play accepted frames in arrival order.

use proptest::prelude::*;
use std::collections::HashSet;
use std::time::Duration;
use voice_playback::{
    CircularAudioBuffer, Delivery, EnqueueOutcome, MemoryEngine, PlaybackEngine,
    PlaybackScheduler, SchedulerState,
};
use voice_protocol::AudioFormat;

#[derive(Debug, Clone)]
enum Step {
    /// A frame arrives from the network
    Arrive,
    /// The engine plays up to this many slots
    Play(usize),
    /// Periodic maintenance
    Tick,
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => Just(Step::Arrive),
        2 => (0usize..4).prop_map(Step::Play),
        1 => Just(Step::Tick),
    ]
}

/// Frame whose samples all carry its sequence number
fn frame(seq: u16) -> Vec<u8> {
    seq.to_le_bytes().repeat(8)
}

fn frame_seq(pcm: &[u8]) -> u16 {
    u16::from_le_bytes([pcm[0], pcm[1]])
}

proptest! {
    #[test]
    fn prop_scheduler_bounds_and_order(slots in 1usize..8, steps in prop::collection::vec(step_strategy(), 1..200)) {
        let mut scheduler = PlaybackScheduler::new(
            "remote",
            MemoryEngine::new(),
            slots,
            Duration::from_secs(60),
            tracing::Span::none(),
        )
        .unwrap();
        scheduler.start();

        let mut next_seq = 0u16;
        let mut accepted = Vec::new();
        let mut played = Vec::new();

        for step in steps {
            match step {
                Step::Arrive => {
                    let seq = next_seq;
                    next_seq += 1;
                    match scheduler.enqueue_incoming(&frame(seq)).unwrap() {
                        Delivery::Queued => accepted.push(seq),
                        Delivery::Dropped => prop_assert!(scheduler.buffer().is_full()),
                        Delivery::Ignored => prop_assert!(false, "frame ignored while started"),
                    }
                }
                Step::Play(n) => {
                    scheduler.engine_mut().advance(n);
                }
                Step::Tick => scheduler.tick().unwrap(),
            }

            played.extend(scheduler.engine_mut().take_played().iter().map(|pcm| frame_seq(pcm)));

            let buffer = scheduler.buffer();
            prop_assert!(buffer.queued_len() <= slots);
            prop_assert_eq!(buffer.queued_len() + buffer.available_len(), slots);
            prop_assert!(scheduler.engine().queued_len() <= slots);
        }

        // Played audio is always a prefix of accepted audio
        prop_assert!(played.len() <= accepted.len());
        prop_assert_eq!(&accepted[..played.len()], &played[..]);

        let stats = scheduler.stats();
        prop_assert_eq!(stats.accepted as usize, accepted.len());
        prop_assert_eq!((stats.accepted + stats.dropped) as u16, next_seq);
    }

    #[test]
    fn prop_buffer_reuses_slots_in_fifo_order(slots in 1usize..8, arrivals in 1usize..40) {
        let mut engine = MemoryEngine::new();
        let mut buffer =
            CircularAudioBuffer::new(&mut engine, slots, AudioFormat::MONO16_48K, tracing::Span::none())
                .unwrap();
        engine.play().unwrap();

        let mut used = HashSet::new();
        let mut order = Vec::new();
        for seq in 0..arrivals {
            buffer.drain_completed(&mut engine).unwrap();
            match buffer.enqueue(&mut engine, &frame(seq as u16)).unwrap() {
                EnqueueOutcome::Queued(slot) => {
                    used.insert(slot);
                    order.push(slot);
                }
                EnqueueOutcome::Dropped => prop_assert!(false, "free slot expected"),
            }
            // Each frame finishes before the next one arrives
            engine.advance(1);
            if engine.state() != voice_playback::SourceState::Playing {
                engine.play().unwrap();
            }
        }

        prop_assert!(used.len() <= slots);
        // Slots cycle round-robin through the pool
        for (i, slot) in order.iter().enumerate().skip(slots) {
            prop_assert_eq!(*slot, order[i - slots]);
        }
    }
}

#[test]
fn test_full_buffer_drops_newest() {
    let mut scheduler = PlaybackScheduler::new(
        "remote",
        MemoryEngine::new(),
        4,
        Duration::from_secs(60),
        tracing::Span::none(),
    )
    .unwrap();
    scheduler.start();

    for seq in 0..6 {
        scheduler.enqueue_incoming(&frame(seq)).unwrap();
    }
    assert_eq!(scheduler.state(), SchedulerState::Playing);
    assert_eq!(scheduler.stats().dropped, 2);

    scheduler.engine_mut().advance(10);
    let played: Vec<u16> = scheduler
        .engine_mut()
        .take_played()
        .iter()
        .map(|pcm| frame_seq(pcm))
        .collect();
    assert_eq!(played, vec![0, 1, 2, 3]);
}
