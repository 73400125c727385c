//! Configuration module for the music bot.
//!
//! Handles loading of Telegram API credentials and the tunable
//! playback/resolver settings from the environment.

mod settings;

pub use settings::{BotSettings, ConfigError, TelegramConfig};

/// Session name used when `SESSION_NAME` is not set.
pub const DEFAULT_SESSION_NAME: &str = "krishnavi_session";

/// Default yt-dlp format selector (prefer opus-in-webm audio).
pub const DEFAULT_YTDL_FORMAT: &str = "bestaudio[ext=webm][acodec=opus]/bestaudio/best";
