//! Application settings and Telegram configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{DEFAULT_SESSION_NAME, DEFAULT_YTDL_FORMAT};

/// Telegram API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Telegram API ID (obtain from <https://my.telegram.org>).
    pub api_id: i32,

    /// Telegram API hash (obtain from <https://my.telegram.org>).
    pub api_hash: String,

    /// Bot token issued by `@BotFather`.
    pub bot_token: String,

    /// Session name; the session file is `<name>.session`.
    #[serde(default = "default_session_name")]
    pub session_name: String,
}

fn default_session_name() -> String {
    DEFAULT_SESSION_NAME.to_owned()
}

impl TelegramConfig {
    /// Creates configuration from environment variables.
    ///
    /// Expects `API_ID`, `API_HASH` and `BOT_TOKEN` to be set;
    /// `SESSION_NAME` is optional.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Creates configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &'static str| {
            lookup(key)
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::MissingEnvVar(key))
        };

        let api_id: i32 = required("API_ID")?
            .parse()
            .map_err(|_| ConfigError::InvalidApiId)?;
        if api_id == 0 {
            return Err(ConfigError::InvalidApiId);
        }

        let api_hash = required("API_HASH")?;
        let bot_token = required("BOT_TOKEN")?;

        let session_name = lookup("SESSION_NAME")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(default_session_name);

        Ok(Self {
            api_id,
            api_hash,
            bot_token,
            session_name,
        })
    }

    /// Path of the session file derived from the session name.
    #[must_use]
    pub fn session_path(&self) -> PathBuf {
        PathBuf::from(format!("{}.session", self.session_name))
    }
}

/// Bot-specific settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotSettings {
    /// Path or name of the yt-dlp executable.
    #[serde(default = "default_ytdlp_path")]
    pub ytdlp_path: String,

    /// Path or name of the ffmpeg executable.
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,

    /// yt-dlp format selector.
    #[serde(default = "default_ytdl_format")]
    pub ytdl_format: String,

    /// Timeout for a single yt-dlp resolution in seconds.
    #[serde(default = "default_resolve_timeout")]
    pub resolve_timeout_secs: u64,

    /// Upper bound on how long a single track may play, in seconds.
    #[serde(default = "default_track_cap")]
    pub track_cap_secs: u64,

    /// Fallback wake-up interval of the play loop, in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Maximum number of queued tracks per chat.
    #[serde(default = "default_max_queue_len")]
    pub max_queue_len: usize,

    /// Minimum interval between outgoing messages, in milliseconds.
    #[serde(default = "default_reply_min_interval")]
    pub reply_min_interval_ms: u64,

    /// Directory where per-chat PCM streams are written.
    #[serde(default = "default_pcm_dir")]
    pub pcm_dir: PathBuf,
}

fn default_ytdlp_path() -> String {
    "yt-dlp".to_owned()
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_owned()
}

fn default_ytdl_format() -> String {
    DEFAULT_YTDL_FORMAT.to_owned()
}

fn default_resolve_timeout() -> u64 {
    60
}

fn default_track_cap() -> u64 {
    60 * 60 * 4 // 4 hours
}

fn default_poll_interval() -> u64 {
    5
}

fn default_max_queue_len() -> usize {
    100
}

fn default_reply_min_interval() -> u64 {
    300
}

fn default_pcm_dir() -> PathBuf {
    PathBuf::from("voice")
}

impl Default for BotSettings {
    fn default() -> Self {
        Self {
            ytdlp_path: default_ytdlp_path(),
            ffmpeg_path: default_ffmpeg_path(),
            ytdl_format: default_ytdl_format(),
            resolve_timeout_secs: default_resolve_timeout(),
            track_cap_secs: default_track_cap(),
            poll_interval_secs: default_poll_interval(),
            max_queue_len: default_max_queue_len(),
            reply_min_interval_ms: default_reply_min_interval(),
            pcm_dir: default_pcm_dir(),
        }
    }
}

impl BotSettings {
    /// Creates bot settings from environment variables with defaults.
    #[must_use]
    pub fn from_env_with_defaults() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Creates bot settings from an arbitrary variable lookup.
    ///
    /// Unset or unparsable values fall back to their defaults.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let number = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());

        Self {
            ytdlp_path: lookup("YTDLP_PATH").unwrap_or_else(default_ytdlp_path),
            ffmpeg_path: lookup("FFMPEG_PATH").unwrap_or_else(default_ffmpeg_path),
            ytdl_format: lookup("YTDL_FORMAT").unwrap_or_else(default_ytdl_format),
            resolve_timeout_secs: number("RESOLVE_TIMEOUT_SECS")
                .filter(|&v| v > 0)
                .unwrap_or_else(default_resolve_timeout),
            track_cap_secs: number("TRACK_CAP_SECS")
                .filter(|&v| v > 0)
                .unwrap_or_else(default_track_cap),
            poll_interval_secs: number("POLL_INTERVAL_SECS")
                .filter(|&v| v > 0)
                .unwrap_or_else(default_poll_interval),
            max_queue_len: lookup("MAX_QUEUE_LEN")
                .and_then(|s| s.trim().parse().ok())
                .filter(|&v: &usize| v > 0)
                .unwrap_or_else(default_max_queue_len),
            reply_min_interval_ms: number("REPLY_MIN_INTERVAL_MS")
                .unwrap_or_else(default_reply_min_interval),
            pcm_dir: lookup("PCM_DIR").map_or_else(default_pcm_dir, PathBuf::from),
        }
    }

    /// Resolution timeout as a [`Duration`].
    #[must_use]
    pub const fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout_secs)
    }

    /// Track safety cap as a [`Duration`].
    #[must_use]
    pub const fn track_cap(&self) -> Duration {
        Duration::from_secs(self.track_cap_secs)
    }

    /// Play loop poll interval as a [`Duration`].
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Outgoing message spacing as a [`Duration`].
    #[must_use]
    pub const fn reply_min_interval(&self) -> Duration {
        Duration::from_millis(self.reply_min_interval_ms)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),

    #[error("Invalid API_ID (must be a non-zero integer)")]
    InvalidApiId,
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_settings() {
        let settings = BotSettings::default();
        assert_eq!(settings.ytdlp_path, "yt-dlp");
        assert_eq!(settings.track_cap_secs, 14_400);
        assert_eq!(settings.poll_interval_secs, 5);
        assert_eq!(settings.ytdl_format, DEFAULT_YTDL_FORMAT);
    }

    #[test]
    fn test_telegram_config_default_session() {
        let config = TelegramConfig::from_lookup(lookup_from(&[
            ("API_ID", "12345"),
            ("API_HASH", "abc123"),
            ("BOT_TOKEN", "1:tok"),
            ("SESSION_NAME", "  "),
        ]))
        .unwrap();
        assert_eq!(config.session_name, "krishnavi_session");
        assert_eq!(config.session_path(), PathBuf::from("krishnavi_session.session"));
    }

    #[test]
    fn test_telegram_config_from_lookup() {
        let config = TelegramConfig::from_lookup(lookup_from(&[
            ("API_ID", "42"),
            ("API_HASH", "hash"),
            ("BOT_TOKEN", "1:tok"),
            ("SESSION_NAME", "custom"),
        ]))
        .unwrap();
        assert_eq!(config.api_id, 42);
        assert_eq!(config.bot_token, "1:tok");
        assert_eq!(config.session_path(), PathBuf::from("custom.session"));
    }

    #[test]
    fn test_telegram_config_missing_token() {
        let err = TelegramConfig::from_lookup(lookup_from(&[
            ("API_ID", "42"),
            ("API_HASH", "hash"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar("BOT_TOKEN")));
    }

    #[test]
    fn test_telegram_config_empty_hash_is_missing() {
        let err = TelegramConfig::from_lookup(lookup_from(&[
            ("API_ID", "42"),
            ("API_HASH", "  "),
            ("BOT_TOKEN", "1:tok"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar("API_HASH")));
    }

    #[test]
    fn test_telegram_config_zero_api_id() {
        let err = TelegramConfig::from_lookup(lookup_from(&[
            ("API_ID", "0"),
            ("API_HASH", "hash"),
            ("BOT_TOKEN", "1:tok"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidApiId));
    }

    #[test]
    fn test_settings_from_lookup_falls_back() {
        let settings = BotSettings::from_lookup(lookup_from(&[
            ("TRACK_CAP_SECS", "not-a-number"),
            ("POLL_INTERVAL_SECS", "0"),
            ("MAX_QUEUE_LEN", "3"),
            ("FFMPEG_PATH", "/usr/bin/ffmpeg"),
        ]));
        assert_eq!(settings.track_cap_secs, 14_400);
        assert_eq!(settings.poll_interval_secs, 5);
        assert_eq!(settings.max_queue_len, 3);
        assert_eq!(settings.ffmpeg_path, "/usr/bin/ffmpeg");
    }
}
