//! Play loop runner.
//!
//! One loop runs per chat while its queue has work:
//! 1. Pop the next track and mark it as now playing
//! 2. Try to join the call; if that fails, try to change the stream
//!    - no voice chat at all → stop the loop, keep the queue
//!    - any other failure → drop the track, go to 1
//! 3. Wait until the stream ends, a skip/stop arrives, the safety cap
//!    elapses, or a poll finds the stream gone
//! 4. Queue empty → leave the call and exit
//!
//! Commands never touch the backend stream directly except `leave`,
//! `pause` and `resume`. Skips are routed through the loop so that only
//! the loop switches tracks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::{MissedTickBehavior, interval, sleep};
use tracing::{debug, error, info, warn};

use super::state::{ChatState, EnqueueOutcome, LoopCommand, PlayerError, PlayerEvent, QueueSnapshot, SkipOutcome};
use crate::config::BotSettings;
use crate::media::Track;
use crate::voice::{ChatId, VoiceCalls, VoiceError};

/// Capacity of each loop's control channel.
const CONTROL_CAPACITY: usize = 8;

/// How long `shutdown` waits for loops to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Tunables for the play loops.
#[derive(Debug, Clone)]
pub struct PlayerSettings {
    /// Upper bound on a single track's play time.
    pub track_cap: Duration,
    /// Fallback wake-up interval while waiting on a track.
    pub poll_interval: Duration,
    /// Maximum queued tracks per chat.
    pub max_queue_len: usize,
}

impl PlayerSettings {
    /// Extracts player tunables from bot settings.
    #[must_use]
    pub fn from_bot_settings(settings: &BotSettings) -> Self {
        Self {
            track_cap: settings.track_cap(),
            poll_interval: settings.poll_interval(),
            max_queue_len: settings.max_queue_len,
        }
    }
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self::from_bot_settings(&BotSettings::default())
    }
}

/// How waiting on a track ended.
enum WaitEnd {
    Finished,
    Skipped(oneshot::Sender<SkipOutcome>),
    Stopped,
    CapReached,
}

struct PlayerInner {
    voice: Arc<dyn VoiceCalls>,
    chats: Mutex<HashMap<ChatId, ChatState>>,
    settings: PlayerSettings,
    events: Option<mpsc::Sender<PlayerEvent>>,
}

/// Shared handle to every chat's queue and play loop.
#[derive(Clone)]
pub struct Player {
    inner: Arc<PlayerInner>,
}

impl Player {
    /// Creates a player driving the given voice backend.
    #[must_use]
    pub fn new(voice: Arc<dyn VoiceCalls>, settings: PlayerSettings) -> Self {
        Self {
            inner: Arc::new(PlayerInner {
                voice,
                chats: Mutex::new(HashMap::new()),
                settings,
                events: None,
            }),
        }
    }

    /// Creates a player that reports loop events on `events`.
    #[must_use]
    pub fn with_events(
        voice: Arc<dyn VoiceCalls>,
        settings: PlayerSettings,
        events: mpsc::Sender<PlayerEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(PlayerInner {
                voice,
                chats: Mutex::new(HashMap::new()),
                settings,
                events: Some(events),
            }),
        }
    }

    /// Appends a track to the chat's queue, starting a loop if none runs.
    pub async fn enqueue(&self, chat: ChatId, track: Track) -> Result<EnqueueOutcome, PlayerError> {
        let mut chats = self.inner.chats.lock().await;
        let state = chats.entry(chat).or_default();

        if state.queue.len() >= self.inner.settings.max_queue_len {
            return Err(PlayerError::QueueFull(self.inner.settings.max_queue_len));
        }

        debug!("Queueing \"{}\" in chat {}", track.title, chat);
        state.queue.push_back(track);
        let position = state.queue.len();

        let started_loop = if state.loop_running {
            false
        } else {
            let (tx, rx) = mpsc::channel(CONTROL_CAPACITY);
            state.loop_running = true;
            state.control = Some(tx);

            let player = self.clone();
            state.task = Some(tokio::spawn(async move {
                player.run_loop(chat, rx).await;
            }));
            info!("Started play loop for chat {}", chat);
            true
        };

        Ok(EnqueueOutcome {
            position,
            started_loop,
        })
    }

    /// Skips the current track.
    pub async fn skip(&self, chat: ChatId) -> SkipOutcome {
        let control = {
            let chats = self.inner.chats.lock().await;
            match chats.get(&chat) {
                Some(state) if state.now_playing.is_some() => state.control.clone(),
                _ => None,
            }
        };

        let Some(control) = control else {
            return SkipOutcome::NothingPlaying;
        };

        let (tx, rx) = oneshot::channel();
        if control.send(LoopCommand::Skip(tx)).await.is_err() {
            return SkipOutcome::NothingPlaying;
        }

        rx.await.unwrap_or(SkipOutcome::Failed)
    }

    /// Pauses the chat's stream.
    pub async fn pause(&self, chat: ChatId) -> Result<(), VoiceError> {
        self.inner.voice.pause(chat).await
    }

    /// Resumes the chat's stream.
    pub async fn resume(&self, chat: ChatId) -> Result<(), VoiceError> {
        self.inner.voice.resume(chat).await
    }

    /// Clears the queue and leaves the chat's call.
    pub async fn leave(&self, chat: ChatId) -> Result<(), VoiceError> {
        let control = {
            let mut chats = self.inner.chats.lock().await;
            chats.get_mut(&chat).and_then(|state| {
                state.queue.clear();
                state.clear_playing();
                state.epoch += 1;
                state.control.clone().map(|control| (control, state.epoch))
            })
        };

        let result = self.inner.voice.leave(chat).await;

        if let Some((control, epoch)) = control {
            let _ = control.try_send(LoopCommand::Stop(epoch));
        }
        result
    }

    /// Returns what is playing and queued in a chat.
    pub async fn snapshot(&self, chat: ChatId) -> QueueSnapshot {
        self.inner
            .chats
            .lock()
            .await
            .get(&chat)
            .map(ChatState::snapshot)
            .unwrap_or_default()
    }

    /// Stops every play loop and leaves every call.
    pub async fn shutdown(&self) {
        let tasks: Vec<_> = {
            let mut chats = self.inner.chats.lock().await;
            chats
                .values_mut()
                .filter_map(|state| {
                    state.queue.clear();
                    state.clear_playing();
                    state.epoch += 1;
                    if let Some(control) = &state.control {
                        let _ = control.try_send(LoopCommand::Stop(state.epoch));
                    }
                    state.task.take()
                })
                .collect()
        };

        info!("Stopping {} play loop(s)", tasks.len());
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                warn!("Play loop did not stop in time, aborting");
                abort.abort();
            }
        }
    }

    /// Drains a chat's queue into the voice call.
    async fn run_loop(&self, chat: ChatId, mut rx: mpsc::Receiver<LoopCommand>) {
        let mut pending_skip: Option<oneshot::Sender<SkipOutcome>> = None;

        loop {
            let (next, epoch) = {
                let mut chats = self.inner.chats.lock().await;
                let state = chats.entry(chat).or_default();
                let next = state.start_next();
                if next.is_none() {
                    state.clear_playing();
                }
                (next, state.epoch)
            };

            let Some(track) = next else {
                let left = self.inner.voice.leave(chat).await;
                if let Some(tx) = pending_skip.take() {
                    let outcome = match left {
                        Err(VoiceError::NotInGroupCall | VoiceError::GroupCallNotFound) => {
                            SkipOutcome::StoppedNotInCall
                        }
                        _ => SkipOutcome::Stopped,
                    };
                    let _ = tx.send(outcome);
                }
                if self.finish_if_idle(chat, &mut rx).await {
                    break;
                }
                continue;
            };

            match self.start_track(chat, &track).await {
                Ok(()) => {
                    info!("Now playing in chat {}: \"{}\"", chat, track.title);
                    if let Some(tx) = pending_skip.take() {
                        let _ = tx.send(SkipOutcome::Skipping);
                    }
                    self.emit(PlayerEvent::NowPlaying {
                        chat,
                        track: track.clone(),
                    });
                }
                Err(VoiceError::GroupCallNotFound) => {
                    warn!("No active voice chat in {}, stopping play loop", chat);
                    if let Some(tx) = pending_skip.take() {
                        let _ = tx.send(SkipOutcome::StoppedNotInCall);
                    }
                    self.inner
                        .chats
                        .lock()
                        .await
                        .entry(chat)
                        .or_default()
                        .mark_stopped();
                    self.emit(PlayerEvent::NoVoiceChat { chat });
                    return;
                }
                Err(e) => {
                    error!("Failed to play \"{}\" in chat {}: {}", track.title, chat, e);
                    if let Some(tx) = pending_skip.take() {
                        let _ = tx.send(SkipOutcome::Failed);
                    }
                    self.clear_playing(chat).await;
                    self.emit(PlayerEvent::TrackFailed {
                        chat,
                        title: track.title.clone(),
                        error: e.to_string(),
                    });
                    continue;
                }
            }

            match self.wait_track(chat, epoch, &mut rx).await {
                WaitEnd::Finished => debug!("Track finished in chat {}", chat),
                WaitEnd::Skipped(tx) => {
                    debug!("Skip requested in chat {}", chat);
                    pending_skip = Some(tx);
                }
                WaitEnd::Stopped => debug!("Stop requested in chat {}", chat),
                WaitEnd::CapReached => {
                    warn!("Track \"{}\" hit the play time cap in chat {}", track.title, chat);
                }
            }
        }

        info!("Play loop for chat {} finished", chat);
    }

    /// Starts a track, joining the call or switching the running stream.
    async fn start_track(&self, chat: ChatId, track: &Track) -> Result<(), VoiceError> {
        match self.inner.voice.join(chat, &track.stream_url).await {
            Ok(()) => Ok(()),
            Err(VoiceError::GroupCallNotFound) => Err(VoiceError::GroupCallNotFound),
            Err(e) => {
                debug!("Join failed in chat {} ({}), changing stream", chat, e);
                self.inner.voice.change_stream(chat, &track.stream_url).await
            }
        }
    }

    /// Waits for the current track to end one way or another.
    ///
    /// `epoch` is the chat's epoch when the track was popped. Stop requests
    /// left over from an earlier leave are ignored.
    async fn wait_track(
        &self,
        chat: ChatId,
        epoch: u64,
        rx: &mut mpsc::Receiver<LoopCommand>,
    ) -> WaitEnd {
        let cap = sleep(self.inner.settings.track_cap);
        tokio::pin!(cap);

        let mut poll = interval(self.inner.settings.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        poll.tick().await;

        loop {
            tokio::select! {
                () = self.inner.voice.wait_finished(chat) => return WaitEnd::Finished,
                cmd = rx.recv() => match cmd {
                    Some(LoopCommand::Skip(tx)) => return WaitEnd::Skipped(tx),
                    Some(LoopCommand::Stop(target)) if target > epoch => return WaitEnd::Stopped,
                    Some(LoopCommand::Stop(target)) => {
                        debug!("Ignoring stale stop ({}) in chat {} at epoch {}", target, chat, epoch);
                    }
                    None => return WaitEnd::Stopped,
                },
                () = &mut cap => return WaitEnd::CapReached,
                _ = poll.tick() => {
                    let cleared = self
                        .inner
                        .chats
                        .lock()
                        .await
                        .get(&chat)
                        .is_none_or(|s| s.now_playing.is_none());
                    if cleared || !self.inner.voice.is_active(chat).await {
                        return WaitEnd::Finished;
                    }
                }
            }
        }
    }

    /// Marks the loop stopped if no work arrived meanwhile.
    ///
    /// Returns `false` when new tracks were queued and the loop must go on.
    async fn finish_if_idle(&self, chat: ChatId, rx: &mut mpsc::Receiver<LoopCommand>) -> bool {
        let mut chats = self.inner.chats.lock().await;
        let state = chats.entry(chat).or_default();

        if !state.queue.is_empty() {
            return false;
        }

        // Answer anything still queued for a loop that is going away.
        while let Ok(cmd) = rx.try_recv() {
            if let LoopCommand::Skip(tx) = cmd {
                let _ = tx.send(SkipOutcome::Stopped);
            }
        }

        state.mark_stopped();
        true
    }

    async fn clear_playing(&self, chat: ChatId) {
        if let Some(state) = self.inner.chats.lock().await.get_mut(&chat) {
            state.clear_playing();
        }
    }

    fn emit(&self, event: PlayerEvent) {
        if let Some(events) = &self.inner.events
            && let Err(e) = events.try_send(event)
        {
            debug!("Dropping player event: {}", e);
        }
    }
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}
