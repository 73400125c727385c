//! Telegram client wrapper for the music bot.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use grammers_client::client::UpdatesConfiguration;
use grammers_client::types::{Chat, PackedChat};
use grammers_client::update::Update;
use grammers_client::{Client, InputMessage, InvocationError, SenderPool, sender};
use grammers_session::storages::SqliteSession;
use thiserror::Error;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::RateLimiter;
use crate::commands::{CommandHandler, IncomingCommand, NO_VOICE_CHAT_TEXT, Requester};
use crate::config::TelegramConfig;
use crate::player::PlayerEvent;
use crate::voice::ChatId;

pub use grammers_client::client::UpdateStream;

/// Errors that can occur during Telegram operations.
#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("Sign in failed: {0}")]
    SignInFailed(String),

    #[error("Flood wait required: {0} seconds")]
    FloodWait(u32),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Unknown chat: {0}")]
    UnknownChat(ChatId),

    #[error("API invocation error: {0}")]
    Invocation(String),
}

impl From<InvocationError> for TelegramError {
    fn from(err: InvocationError) -> Self {
        let err_str = err.to_string();

        // Check for flood wait errors
        if (err_str.contains("FLOOD_WAIT") || err_str.contains("flood"))
            && let Some(seconds) = extract_flood_wait_seconds(&err_str)
        {
            return Self::FloodWait(seconds);
        }

        Self::Invocation(err_str)
    }
}

/// Extracts flood wait seconds from an error message.
fn extract_flood_wait_seconds(err_msg: &str) -> Option<u32> {
    ["FLOOD_WAIT_", "flood wait "].iter().find_map(|pattern| {
        let start = find_ascii_case_insensitive(err_msg, pattern)? + pattern.len();
        let digits: String = err_msg[start..]
            .chars()
            .take_while(char::is_ascii_digit)
            .collect();
        digits.parse().ok()
    })
}

/// Byte offset of an ASCII `needle` in `haystack`, ignoring ASCII case.
///
/// The match is pure ASCII, so both ends of it are char boundaries.
fn find_ascii_case_insensitive(haystack: &str, needle: &str) -> Option<usize> {
    haystack
        .as_bytes()
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle.as_bytes()))
}

/// High-level Telegram client wrapper.
pub struct MusicBot {
    /// The underlying grammers client.
    client: Client,

    /// Handle to the sender pool for disconnection.
    handle: sender::SenderPoolHandle,

    /// Spacing for outgoing messages.
    rate_limiter: RateLimiter,

    /// Chats we have seen, for sending unsolicited notifications.
    chats: RwLock<HashMap<ChatId, PackedChat>>,

    /// Background task running the sender pool.
    _pool_task: JoinHandle<()>,
}

impl MusicBot {
    /// Connects to Telegram and opens the update stream.
    pub async fn connect(
        config: &TelegramConfig,
        reply_min_interval: Duration,
    ) -> Result<(Self, UpdateStream), TelegramError> {
        info!("Connecting to Telegram...");

        let session = Arc::new(
            SqliteSession::open(config.session_path())
                .await
                .map_err(|e| TelegramError::Session(e.to_string()))?,
        );

        let SenderPool {
            runner,
            updates,
            handle,
        } = SenderPool::new(Arc::clone(&session), config.api_id);

        let client = Client::new(handle.clone());

        // Spawn the sender pool runner
        let pool_task = tokio::spawn(async move {
            runner.run().await;
        });

        let is_authorized = client
            .is_authorized()
            .await
            .map_err(|e| TelegramError::Connection(e.to_string()))?;

        info!("Connected to Telegram. Authorized: {}", is_authorized);

        let stream = client
            .stream_updates(
                updates,
                UpdatesConfiguration {
                    catch_up: false,
                    ..Default::default()
                },
            )
            .await;

        Ok((
            Self {
                client,
                handle: handle.thin,
                rate_limiter: RateLimiter::new(reply_min_interval),
                chats: RwLock::new(HashMap::new()),
                _pool_task: pool_task,
            },
            stream,
        ))
    }

    /// Checks if the client is authorized.
    pub async fn is_authorized(&self) -> Result<bool, TelegramError> {
        self.client
            .is_authorized()
            .await
            .map_err(|e| TelegramError::Connection(e.to_string()))
    }

    /// Signs in with the bot token unless the session is already authorized.
    pub async fn ensure_bot_sign_in(&self, config: &TelegramConfig) -> Result<(), TelegramError> {
        if self.is_authorized().await? {
            debug!("Session already authorized");
            return Ok(());
        }

        info!("Signing in as bot {}...", mask_token(&config.bot_token));
        self.client
            .bot_sign_in(&config.bot_token, &config.api_hash)
            .await
            .map_err(|e| TelegramError::SignInFailed(e.to_string()))?;

        info!("Successfully signed in!");
        Ok(())
    }

    /// Returns the bot's own username, if it has one.
    pub async fn username(&self) -> Result<Option<String>, TelegramError> {
        let me = self.client.get_me().await?;
        Ok(me.username().map(str::to_owned))
    }

    /// Reads updates and dispatches commands until the stream fails.
    ///
    /// Every command runs in its own task so a slow `/play` in one chat
    /// doesn't hold up the others.
    pub async fn run(
        self: &Arc<Self>,
        handler: Arc<CommandHandler>,
        updates: &mut UpdateStream,
    ) -> Result<(), TelegramError> {
        info!("Listening for commands");

        loop {
            let update = updates.next().await?;

            let Update::NewMessage(message) = update else {
                continue;
            };
            if message.outgoing() {
                continue;
            }

            let chat = message.chat();
            let chat_id = chat.id();
            self.remember_chat(&chat).await;

            let incoming = IncomingCommand {
                chat_id,
                is_group: matches!(chat, Chat::Group(_)),
                sender: message.sender().map(|s| Requester {
                    id: s.id(),
                    name: s.name().to_owned(),
                }),
                text: message.text().to_owned(),
            };

            let Some(command) = handler.parse(&incoming) else {
                continue;
            };
            debug!(
                "Command from chat {}: \"{}\"",
                chat_id,
                truncate_for_log(&incoming.text, 40)
            );

            let bot = Arc::clone(self);
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                let outcome = async {
                    if let Some(progress) = command.progress_message() {
                        let status = bot
                            .with_flood_retry(chat_id, || message.reply(InputMessage::markdown(progress)))
                            .await?;
                        let result = handler.execute(&incoming, command).await;
                        bot.with_flood_retry(chat_id, || status.edit(InputMessage::markdown(&result.message)))
                            .await?;
                    } else {
                        let result = handler.execute(&incoming, command).await;
                        bot.with_flood_retry(chat_id, || message.reply(InputMessage::markdown(&result.message)))
                            .await?;
                    }
                    Ok::<(), TelegramError>(())
                }
                .await;

                if let Err(e) = outcome {
                    warn!("Failed to answer command in chat {}: {}", chat_id, e);
                }
            });
        }
    }

    /// Forwards player events to their chats until the channel closes.
    pub async fn run_events(self: &Arc<Self>, mut events: mpsc::Receiver<PlayerEvent>) {
        while let Some(event) = events.recv().await {
            let (chat, text) = match event {
                PlayerEvent::NowPlaying { chat, track } => (
                    chat,
                    format!(
                        "🎶 Now playing: {}\nRequested by {}",
                        track.label(),
                        track.requester
                    ),
                ),
                PlayerEvent::NoVoiceChat { chat } => (chat, NO_VOICE_CHAT_TEXT.to_owned()),
                PlayerEvent::TrackFailed { chat, title, error } => (
                    chat,
                    format!("⚠️ Couldn't play **{title}**: `{}`", error.replace('`', "'")),
                ),
            };

            if let Err(e) = self.notify(chat, &text).await {
                warn!("Failed to notify chat {}: {}", chat, e);
            }
        }
        debug!("Player event channel closed");
    }

    /// Sends a markdown message to a previously seen chat.
    pub async fn notify(&self, chat: ChatId, text: &str) -> Result<(), TelegramError> {
        let packed = self
            .chats
            .read()
            .await
            .get(&chat)
            .copied()
            .ok_or(TelegramError::UnknownChat(chat))?;

        self.with_flood_retry(chat, || self.client.send_message(packed, InputMessage::markdown(text)))
            .await?;
        Ok(())
    }

    async fn remember_chat(&self, chat: &Chat) {
        let packed = chat.pack();
        let mut chats = self.chats.write().await;
        if chats.insert(chat.id(), packed).is_none() {
            debug!("First message from chat {}", chat.id());
        }
    }

    /// Sends to `chat` under the rate limiter, retrying once after a flood wait.
    async fn with_flood_retry<F, Fut, T>(&self, chat: ChatId, op: F) -> Result<T, TelegramError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, InvocationError>>,
    {
        send_with_flood_retry(&self.rate_limiter, chat, op).await
    }

    /// Disconnects from Telegram.
    pub fn disconnect(&self) {
        info!("Disconnecting from Telegram...");
        self.handle.quit();
    }
}

impl std::fmt::Debug for MusicBot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MusicBot")
            .field("rate_limiter", &self.rate_limiter)
            .finish_non_exhaustive()
    }
}

/// Runs `op` in the chat's rate-limit slot.
///
/// A `FLOOD_WAIT_N` failure blocks every chat for N seconds, after which
/// `op` is tried exactly once more.
async fn send_with_flood_retry<F, Fut, T, E>(
    limiter: &RateLimiter,
    chat: ChatId,
    op: F,
) -> Result<T, TelegramError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    TelegramError: From<E>,
{
    let waited = limiter.acquire(chat).await;
    if !waited.is_zero() {
        debug!("Waited {:?} for rate limit in chat {}", waited, chat);
    }

    match op().await.map_err(TelegramError::from) {
        Err(TelegramError::FloodWait(seconds)) => {
            warn!("Flood wait triggered: {} seconds", seconds);
            limiter.handle_flood_wait(seconds).await;
            op().await.map_err(|e| {
                let e = TelegramError::from(e);
                error!("Call failed again after flood wait: {}", e);
                e
            })
        }
        other => other,
    }
}

/// Masks a bot token for logging (keeps the bot id before the colon).
fn mask_token(token: &str) -> String {
    match token.split_once(':') {
        Some((id, _)) if !id.is_empty() => format!("{id}:***"),
        _ => "***".to_owned(),
    }
}

/// Truncates a string for logging purposes.
fn truncate_for_log(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_owned()
    } else {
        format!("{}...", s.chars().take(max_len).collect::<String>())
    }
}
