//! Command handler implementation.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::types::{BotCommand, CommandResult, IncomingCommand};
use crate::media::{Track, TrackResolver, format_duration};
use crate::player::{Player, SkipOutcome};
use crate::voice::ChatId;

const HELP_TEXT: &str = "**Krishnavi Music Bot**\n\n\
    Add me to a group, start a voice chat, then use:\n\
    • `/play <song name | YouTube URL>` — queue a song\n\
    • `/queue` — show queue\n\
    • `/skip` — skip current track\n\
    • `/pause` / `/resume` — control playback\n\
    • `/leave` — leave voice chat\n\n\
    Tip: `/play https://youtu.be/...` also works.";

const JOIN_TEXT: &str = "Start a **voice chat** in this group first. \
    Then just use `/play` — I will join automatically.";

/// Reply sent when a loop finds no voice chat to join.
pub const NO_VOICE_CHAT_TEXT: &str = "❌ No active voice chat. Start one, then `/play` again.";

/// Maps chat commands onto player operations.
pub struct CommandHandler {
    /// Our own username, used to ignore commands meant for other bots.
    bot_username: Option<String>,

    /// Shared playback state.
    player: Player,

    /// Turns `/play` queries into tracks.
    resolver: Arc<dyn TrackResolver>,
}

impl CommandHandler {
    /// Creates a new command handler.
    #[must_use]
    pub fn new(player: Player, resolver: Arc<dyn TrackResolver>) -> Self {
        Self {
            bot_username: None,
            player,
            resolver,
        }
    }

    /// Sets the bot's username for `/cmd@botname` filtering.
    #[must_use]
    pub fn with_username(mut self, username: Option<String>) -> Self {
        self.bot_username = username;
        self
    }

    /// Parses a message into a command this chat is allowed to run.
    ///
    /// Returns `None` for plain text, unknown commands, commands for other
    /// bots, and group-only commands sent outside a group.
    #[must_use]
    pub fn parse(&self, message: &IncomingCommand) -> Option<BotCommand> {
        let command = BotCommand::parse(&message.text, self.bot_username.as_deref())?;
        if command.requires_group() && !message.is_group {
            debug!("Ignoring /{} outside a group", command.name());
            return None;
        }
        Some(command)
    }

    /// Tries to parse and execute a command from a message.
    ///
    /// Returns `None` if the message is not a command for us.
    pub async fn try_handle(&self, message: &IncomingCommand) -> Option<CommandResult> {
        let command = self.parse(message)?;
        Some(self.execute(message, command).await)
    }

    /// Executes a parsed command.
    pub async fn execute(&self, message: &IncomingCommand, command: BotCommand) -> CommandResult {
        debug!("Handling command in chat {}: {}", message.chat_id, command);
        let name = command.name();

        let result = match command {
            BotCommand::Start | BotCommand::Help => CommandResult::success(HELP_TEXT),
            BotCommand::Join => CommandResult::success(JOIN_TEXT),
            BotCommand::Play(None) => {
                CommandResult::error("Usage: `/play <song name | YouTube URL>`")
            }
            BotCommand::Play(Some(query)) => self.handle_play(message, &query).await,
            BotCommand::Queue => self.handle_queue(message.chat_id).await,
            BotCommand::Skip => self.handle_skip(message.chat_id).await,
            BotCommand::Pause => self.handle_pause(message.chat_id).await,
            BotCommand::Resume => self.handle_resume(message.chat_id).await,
            BotCommand::Leave => self.handle_leave(message.chat_id).await,
        };

        info!(
            "Command /{} in chat {}: success={}",
            name,
            message.chat_id,
            result.success
        );
        result
    }

    async fn handle_play(&self, message: &IncomingCommand, query: &str) -> CommandResult {
        let resolved = match self.resolver.resolve(query).await {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!("Failed to resolve \"{}\": {}", query, e);
                return CommandResult::error(format!("❌ Failed to queue: {}", code(&e.to_string())));
            }
        };

        let track = Track::from_resolved(resolved, message.requester_mention());
        let label = match &track.duration {
            Some(d) => format!("**{}** `[{d}]`", track.title),
            None => format!("**{}**", track.title),
        };
        let requester = track.requester.clone();

        match self.player.enqueue(message.chat_id, track).await {
            Ok(outcome) => {
                debug!("Queued at position {}", outcome.position);
                CommandResult::success(format!("✅ Queued: {label}\nRequested by {requester}"))
            }
            Err(e) => CommandResult::error(format!("❌ Failed to queue: {}", code(&e.to_string()))),
        }
    }

    async fn handle_queue(&self, chat: ChatId) -> CommandResult {
        let snapshot = self.player.snapshot(chat).await;
        if snapshot.is_empty() {
            return CommandResult::success("🗒️ Queue is empty.");
        }

        let mut lines = Vec::new();

        if let Some(track) = &snapshot.now_playing {
            let elapsed = snapshot
                .started_at
                .map(|started| {
                    let secs = (Utc::now() - started).num_seconds().max(0);
                    format!(" (playing for {})", format_duration(secs.unsigned_abs()))
                })
                .unwrap_or_default();
            lines.push(format!("**Now Playing:** {}{elapsed}\n", track.label()));
        }

        for (i, track) in snapshot.queue.iter().enumerate() {
            lines.push(format!("{}. {}", i + 1, track.label()));
        }

        CommandResult::success(lines.join("\n"))
    }

    async fn handle_skip(&self, chat: ChatId) -> CommandResult {
        match self.player.skip(chat).await {
            SkipOutcome::NothingPlaying => CommandResult::error("Nothing to skip."),
            SkipOutcome::Skipping => CommandResult::success("⏭️ Skipping…"),
            SkipOutcome::Stopped => CommandResult::success("⏹️ Stopped (queue ended)."),
            SkipOutcome::StoppedNotInCall => CommandResult::success("Stopped."),
            SkipOutcome::Failed => {
                CommandResult::error("Skip failed, but I will try to continue.")
            }
        }
    }

    async fn handle_pause(&self, chat: ChatId) -> CommandResult {
        match self.player.pause(chat).await {
            Ok(()) => CommandResult::success("⏸️ Paused."),
            Err(e) => CommandResult::error(format!("Pause failed: {}", code(&e.to_string()))),
        }
    }

    async fn handle_resume(&self, chat: ChatId) -> CommandResult {
        match self.player.resume(chat).await {
            Ok(()) => CommandResult::success("▶️ Resumed."),
            Err(e) => CommandResult::error(format!("Resume failed: {}", code(&e.to_string()))),
        }
    }

    async fn handle_leave(&self, chat: ChatId) -> CommandResult {
        match self.player.leave(chat).await {
            Ok(()) => CommandResult::success("👋 Left the voice chat."),
            Err(e) => CommandResult::error(format!("Leave failed: {}", code(&e.to_string()))),
        }
    }
}

impl std::fmt::Debug for CommandHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHandler")
            .field("bot_username", &self.bot_username)
            .field("player", &self.player)
            .finish_non_exhaustive()
    }
}

/// Wraps text in an inline code span.
fn code(text: &str) -> String {
    format!("`{}`", text.replace('`', "'"))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::commands::Requester;
    use crate::media::{ResolveError, ResolvedTrack};
    use crate::player::PlayerSettings;
    use crate::voice::{MockVoiceCalls, VoiceCalls};

    const GROUP: ChatId = -100_42;

    /// Resolves any query to a fixed-shape track, failing on "fail".
    struct StubResolver;

    #[async_trait]
    impl TrackResolver for StubResolver {
        async fn resolve(&self, query: &str) -> Result<ResolvedTrack, ResolveError> {
            if query == "fail" {
                return Err(ResolveError::NoResults(query.to_owned()));
            }
            Ok(ResolvedTrack {
                stream_url: format!("https://cdn/{query}"),
                title: query.to_owned(),
                duration: Some("3:45".to_owned()),
                page_url: format!("https://youtu.be/{query}"),
            })
        }
    }

    fn handler() -> (CommandHandler, Arc<MockVoiceCalls>) {
        let mock = Arc::new(MockVoiceCalls::new());
        let voice: Arc<dyn VoiceCalls> = Arc::clone(&mock) as Arc<dyn VoiceCalls>;
        let player = Player::new(
            voice,
            PlayerSettings {
                track_cap: Duration::from_secs(60),
                poll_interval: Duration::from_millis(20),
                max_queue_len: 10,
            },
        );
        (CommandHandler::new(player, Arc::new(StubResolver)), mock)
    }

    fn group_msg(text: &str) -> IncomingCommand {
        IncomingCommand {
            chat_id: GROUP,
            is_group: true,
            sender: Some(Requester {
                id: 7,
                name: "Ann".to_owned(),
            }),
            text: text.to_owned(),
        }
    }

    fn private_msg(text: &str) -> IncomingCommand {
        IncomingCommand {
            chat_id: 7,
            is_group: false,
            sender: None,
            text: text.to_owned(),
        }
    }

    async fn run(handler: &CommandHandler, msg: IncomingCommand) -> CommandResult {
        handler.try_handle(&msg).await.unwrap()
    }

    #[tokio::test]
    async fn test_help_works_everywhere() {
        let (handler, _) = handler();
        let private = run(&handler, private_msg("/help")).await;
        assert!(private.message.contains("Krishnavi Music Bot"));
        let start = run(&handler, group_msg("/start")).await;
        assert_eq!(start.message, private.message);
    }

    #[tokio::test]
    async fn test_group_commands_ignored_in_private() {
        let (handler, _) = handler();
        assert!(handler.try_handle(&private_msg("/play song")).await.is_none());
        assert!(handler.try_handle(&private_msg("/skip")).await.is_none());
        assert!(handler.try_handle(&group_msg("hello")).await.is_none());
    }

    #[tokio::test]
    async fn test_play_usage() {
        let (handler, _) = handler();
        let result = run(&handler, group_msg("/play")).await;
        assert!(!result.success);
        assert!(result.message.starts_with("Usage:"));
    }

    #[tokio::test]
    async fn test_play_queues_track() {
        let (handler, mock) = handler();
        let result = run(&handler, group_msg("/play lofi")).await;
        assert!(result.success);
        assert_eq!(
            result.message,
            "✅ Queued: **lofi** `[3:45]`\nRequested by [Ann](tg://user?id=7)"
        );

        for _ in 0..100 {
            if mock.current_url(GROUP).await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(mock.current_url(GROUP).await.as_deref(), Some("https://cdn/lofi"));
    }

    #[tokio::test]
    async fn test_execute_parsed_play() {
        let (handler, _) = handler();
        let msg = group_msg("/play ignored");
        let result = handler
            .execute(&msg, BotCommand::Play(Some("direct".to_owned())))
            .await;
        assert!(result.success);
        assert!(result.message.starts_with("✅ Queued: **direct**"));
        assert!(!handler.player.snapshot(GROUP).await.is_empty());
    }

    #[tokio::test]
    async fn test_play_resolve_failure() {
        let (handler, _) = handler();
        let result = run(&handler, group_msg("/play fail")).await;
        assert!(!result.success);
        assert_eq!(result.message, "❌ Failed to queue: `No results found for: fail`");
    }

    #[tokio::test]
    async fn test_queue_listing() {
        let (handler, mock) = handler();
        assert_eq!(run(&handler, group_msg("/queue")).await.message, "🗒️ Queue is empty.");

        run(&handler, group_msg("/play one")).await;
        run(&handler, group_msg("/play two")).await;
        for _ in 0..100 {
            if mock.current_url(GROUP).await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let listing = run(&handler, group_msg("/queue")).await.message;
        assert!(listing.starts_with("**Now Playing:** one `[3:45]` (playing for 0:0"));
        assert!(listing.ends_with("\n\n1. two `[3:45]`"));
    }

    #[tokio::test]
    async fn test_skip_and_leave_replies() {
        let (handler, mock) = handler();
        assert_eq!(run(&handler, group_msg("/skip")).await.message, "Nothing to skip.");

        run(&handler, group_msg("/play one")).await;
        run(&handler, group_msg("/play two")).await;
        for _ in 0..100 {
            if mock.current_url(GROUP).await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(run(&handler, group_msg("/skip")).await.message, "⏭️ Skipping…");
        assert_eq!(
            run(&handler, group_msg("/skip")).await.message,
            "⏹️ Stopped (queue ended)."
        );
        assert_eq!(
            run(&handler, group_msg("/leave")).await.message,
            "Leave failed: `Not in a voice chat`"
        );
    }

    #[tokio::test]
    async fn test_pause_without_call() {
        let (handler, _) = handler();
        let result = run(&handler, group_msg("/pause")).await;
        assert_eq!(result.message, "Pause failed: `Not in a voice chat`");
        let result = run(&handler, group_msg("/resume")).await;
        assert_eq!(result.message, "Resume failed: `Not in a voice chat`");
    }

    #[test]
    fn test_code_escapes_backticks() {
        assert_eq!(code("a `b` c"), "`a 'b' c`");
    }
}
