//! Voice Playback
//!
//! Receive-side audio path: a fixed pool of engine slots per remote player
//! (the jitter buffer), a scheduler that keeps each player's engine source
//! fed and playing, and an ordered task queue that moves frames from network
//! threads onto the thread owning the playback engine.

pub mod buffer;
pub mod engine;
pub mod manager;
pub mod scheduler;
pub mod task_queue;

pub use buffer::{BufferError, BufferStats, CircularAudioBuffer, EnqueueOutcome, DEFAULT_SLOTS};
pub use engine::{EngineError, MemoryEngine, PlaybackEngine, SlotId, SourceState, SpatialParams, Vec3};
pub use manager::{ManagerError, PlaybackConfig, PlaybackManager};
pub use scheduler::{
    Delivery, PlaybackScheduler, SchedulerError, SchedulerState, SpatialSource,
    DEFAULT_REFRESH_INTERVAL,
};
pub use task_queue::{TaskQueue, TaskSender};
