//! Voice call backend abstraction.
//!
//! The player drives voice chats exclusively through [`VoiceCalls`], so the
//! transport can be swapped without touching queue logic.
//!
//! # Implementations
//!
//! - [`FfmpegVoiceCalls`]: decodes each stream with FFmpeg and pipes raw PCM
//!   into a [`FrameSink`] at real-time pace
//! - [`MockVoiceCalls`]: in-memory implementation for testing

mod ffmpeg;
pub mod mock;

pub use ffmpeg::{FfmpegVoiceCalls, FrameSink, PcmFileSink, FRAME_BYTES};
pub use mock::{MockVoiceCalls, VoiceEvent};

use async_trait::async_trait;
use thiserror::Error;

/// Telegram chat identifier (bot API dialog id).
pub type ChatId = i64;

/// Errors reported by a voice backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VoiceError {
    #[error("No active voice chat in this group")]
    GroupCallNotFound,

    #[error("Not in a voice chat")]
    NotInGroupCall,

    #[error("Already streaming in this voice chat")]
    AlreadyJoined,

    #[error("{0}")]
    Backend(String),
}

/// Operations the player needs from a voice chat transport.
///
/// Implementations must be `Send + Sync` so a single backend can be shared
/// by every chat's play loop through an `Arc<dyn VoiceCalls>`.
#[async_trait]
pub trait VoiceCalls: Send + Sync + 'static {
    /// Joins the chat's voice call and starts streaming `stream_url`.
    ///
    /// Fails with [`VoiceError::AlreadyJoined`] when a stream is active.
    async fn join(&self, chat: ChatId, stream_url: &str) -> Result<(), VoiceError>;

    /// Replaces the active stream in a joined call.
    async fn change_stream(&self, chat: ChatId, stream_url: &str) -> Result<(), VoiceError>;

    /// Pauses the active stream.
    async fn pause(&self, chat: ChatId) -> Result<(), VoiceError>;

    /// Resumes a paused stream.
    async fn resume(&self, chat: ChatId) -> Result<(), VoiceError>;

    /// Stops streaming and leaves the call.
    async fn leave(&self, chat: ChatId) -> Result<(), VoiceError>;

    /// Whether a stream is currently active in the chat.
    async fn is_active(&self, chat: ChatId) -> bool;

    /// Resolves once the chat's current stream has ended.
    ///
    /// Returns immediately when nothing is streaming.
    async fn wait_finished(&self, chat: ChatId);
}
