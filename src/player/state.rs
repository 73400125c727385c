//! Player state management.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::media::Track;
use crate::voice::ChatId;

/// Commands delivered to a running play loop.
#[derive(Debug)]
pub(super) enum LoopCommand {
    /// Move on to the next track and report how that went.
    Skip(oneshot::Sender<SkipOutcome>),
    /// Stop waiting on tracks started before the given epoch.
    Stop(u64),
}

/// Playback state of a single chat.
#[derive(Debug, Default)]
pub struct ChatState {
    /// Tracks waiting to be played.
    pub queue: VecDeque<Track>,

    /// Track currently streaming, if any.
    pub now_playing: Option<Track>,

    /// When the current track started.
    pub started_at: Option<DateTime<Utc>>,

    /// Bumped by every leave; tracks started earlier belong to the old session.
    pub(super) epoch: u64,

    /// Whether a play loop owns this chat.
    pub(super) loop_running: bool,

    /// Control channel of the running loop.
    pub(super) control: Option<mpsc::Sender<LoopCommand>>,

    /// Handle of the running loop.
    pub(super) task: Option<JoinHandle<()>>,
}

impl ChatState {
    /// Pops the next track and marks it as playing.
    pub(super) fn start_next(&mut self) -> Option<Track> {
        let track = self.queue.pop_front()?;
        self.now_playing = Some(track.clone());
        self.started_at = Some(Utc::now());
        Some(track)
    }

    /// Clears the now-playing slot.
    pub(super) fn clear_playing(&mut self) {
        self.now_playing = None;
        self.started_at = None;
    }

    /// Marks the loop as gone.
    pub(super) fn mark_stopped(&mut self) {
        self.clear_playing();
        self.loop_running = false;
        self.control = None;
        self.task = None;
    }

    /// Copies the user-visible part of the state.
    #[must_use]
    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            now_playing: self.now_playing.clone(),
            started_at: self.started_at,
            queue: self.queue.iter().cloned().collect(),
        }
    }
}

/// Point-in-time view of a chat's queue.
#[derive(Debug, Clone, Default)]
pub struct QueueSnapshot {
    pub now_playing: Option<Track>,
    pub started_at: Option<DateTime<Utc>>,
    pub queue: Vec<Track>,
}

impl QueueSnapshot {
    /// True when nothing is playing and nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.now_playing.is_none() && self.queue.is_empty()
    }
}

/// Result of queueing a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOutcome {
    /// 1-based position in the queue.
    pub position: usize,

    /// Whether this call started a new play loop.
    pub started_loop: bool,
}

/// Result of a skip request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipOutcome {
    /// Nothing was playing.
    NothingPlaying,
    /// The next queued track is now streaming.
    Skipping,
    /// The queue was empty; the bot left the call.
    Stopped,
    /// The call was already gone.
    StoppedNotInCall,
    /// The backend failed to switch; the loop keeps going.
    Failed,
}

/// Notifications emitted by play loops.
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    /// A track started streaming.
    NowPlaying { chat: ChatId, track: Track },

    /// The chat has no voice chat to join; the loop stopped.
    NoVoiceChat { chat: ChatId },

    /// A track could not be started and was dropped.
    TrackFailed {
        chat: ChatId,
        title: String,
        error: String,
    },
}

/// Errors returned by player operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlayerError {
    #[error("Queue is full ({0} tracks)")]
    QueueFull(usize),
}
