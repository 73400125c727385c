//! Command types and definitions.

use std::fmt;

use crate::voice::ChatId;

/// Message shown while a `/play` query is being resolved.
pub const SEARCHING_MESSAGE: &str = "🔎 Searching…";

/// Available bot commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCommand {
    /// Greeting; shows the same text as help.
    Start,

    /// Show help information.
    Help,

    /// Explain how to get the bot into a voice chat.
    Join,

    /// Queue a song by search phrase or URL. `None` when no query was given.
    Play(Option<String>),

    /// Show what is playing and queued.
    Queue,

    /// Skip the current track.
    Skip,

    /// Pause playback.
    Pause,

    /// Resume playback.
    Resume,

    /// Clear the queue and leave the voice chat.
    Leave,
}

impl BotCommand {
    /// Parses a command from a message text.
    ///
    /// Accepts `/cmd` and `/cmd@botname`. When `bot_username` is known, a
    /// command addressed to a different bot is ignored.
    /// Returns `None` if the message is not a valid command.
    #[must_use]
    pub fn parse(text: &str, bot_username: Option<&str>) -> Option<Self> {
        let text = text.trim();
        let body = text.strip_prefix('/')?;

        let (head, args) = match body.split_once(char::is_whitespace) {
            Some((head, args)) => (head, Some(args.trim())),
            None => (body, None),
        };

        let (cmd, target) = match head.split_once('@') {
            Some((cmd, target)) => (cmd, Some(target)),
            None => (head, None),
        };

        if let (Some(target), Some(me)) = (target, bot_username)
            && !target.eq_ignore_ascii_case(me.trim_start_matches('@'))
        {
            return None;
        }

        match cmd.to_lowercase().as_str() {
            "start" => Some(Self::Start),
            "help" => Some(Self::Help),
            "join" => Some(Self::Join),
            "play" => Some(Self::Play(
                args.filter(|a| !a.is_empty()).map(str::to_owned),
            )),
            "queue" => Some(Self::Queue),
            "skip" => Some(Self::Skip),
            "pause" => Some(Self::Pause),
            "resume" => Some(Self::Resume),
            "leave" => Some(Self::Leave),
            _ => None,
        }
    }

    /// Whether the command only makes sense inside a group.
    #[must_use]
    pub const fn requires_group(&self) -> bool {
        !matches!(self, Self::Start | Self::Help)
    }

    /// Interim message to send before executing, if any.
    #[must_use]
    pub const fn progress_message(&self) -> Option<&'static str> {
        match self {
            Self::Play(Some(_)) => Some(SEARCHING_MESSAGE),
            _ => None,
        }
    }

    /// Returns the command name as it appears in help.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Help => "help",
            Self::Join => "join",
            Self::Play(_) => "play",
            Self::Queue => "queue",
            Self::Skip => "skip",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Leave => "leave",
        }
    }
}

impl fmt::Display for BotCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Play(Some(query)) => write!(f, "play {query}"),
            _ => write!(f, "{}", self.name()),
        }
    }
}

/// Who sent a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    pub id: i64,
    pub name: String,
}

impl Requester {
    /// Markdown link that mentions the user.
    #[must_use]
    pub fn mention(&self) -> String {
        let name: String = self
            .name
            .chars()
            .filter(|c| !matches!(c, '[' | ']'))
            .collect();
        let name = if name.trim().is_empty() { "User".to_owned() } else { name };
        format!("[{name}](tg://user?id={})", self.id)
    }
}

/// A text message received in a chat.
#[derive(Debug, Clone)]
pub struct IncomingCommand {
    /// Chat the message was sent in.
    pub chat_id: ChatId,

    /// Whether the chat is a group or supergroup.
    pub is_group: bool,

    /// Sender, when Telegram tells us.
    pub sender: Option<Requester>,

    /// Raw message text.
    pub text: String,
}

impl IncomingCommand {
    /// Mention of the sender, or `Someone` if unknown.
    #[must_use]
    pub fn requester_mention(&self) -> String {
        self.sender
            .as_ref()
            .map_or_else(|| "Someone".to_owned(), Requester::mention)
    }
}

/// Result of command execution.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Whether the command was successful.
    pub success: bool,

    /// Response message to show the user (markdown).
    pub message: String,
}

impl CommandResult {
    /// Creates a successful result.
    #[must_use]
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    /// Creates an error result.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}
