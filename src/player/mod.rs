//! Per-chat playback queues.
//!
//! Each chat gets a FIFO queue and at most one play loop that drains it
//! into the voice backend.

mod runner;
mod state;

pub use runner::{Player, PlayerSettings};
pub use state::{ChatState, EnqueueOutcome, PlayerError, PlayerEvent, QueueSnapshot, SkipOutcome};
