//! yt-dlp backed track resolution.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use super::{format_duration, is_url};
use crate::config::BotSettings;

/// Errors that can occur while resolving a query.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Failed to run yt-dlp: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("yt-dlp exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("yt-dlp timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to parse yt-dlp output: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("No results found for: {0}")]
    NoResults(String),

    #[error("Couldn't extract audio stream URL")]
    NoStream,
}

/// Result of resolving a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTrack {
    /// Direct audio stream URL.
    pub stream_url: String,
    /// Display title.
    pub title: String,
    /// Formatted duration, when known.
    pub duration: Option<String>,
    /// Original page URL.
    pub page_url: String,
}

/// Something that can turn a query into a playable stream.
#[async_trait]
pub trait TrackResolver: Send + Sync + 'static {
    /// Resolves a search phrase or URL to a single track.
    async fn resolve(&self, query: &str) -> Result<ResolvedTrack, ResolveError>;
}

/// Resolver that invokes the `yt-dlp` executable.
#[derive(Debug, Clone)]
pub struct YtDlpResolver {
    program: String,
    format: String,
    timeout: Duration,
}

impl YtDlpResolver {
    /// Creates a resolver for the given executable and format selector.
    #[must_use]
    pub fn new(program: impl Into<String>, format: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            format: format.into(),
            timeout,
        }
    }

    /// Creates a resolver from bot settings.
    #[must_use]
    pub fn from_settings(settings: &BotSettings) -> Self {
        Self::new(
            settings.ytdlp_path.clone(),
            settings.ytdl_format.clone(),
            settings.resolve_timeout(),
        )
    }

    /// Command-line arguments for a query.
    fn args(&self, query: &str) -> Vec<String> {
        let target = if is_url(query) {
            query.to_owned()
        } else {
            format!("ytsearch1:{query}")
        };

        vec![
            "-J".to_owned(),
            "--no-playlist".to_owned(),
            "--no-warnings".to_owned(),
            "-f".to_owned(),
            self.format.clone(),
            "--default-search".to_owned(),
            "ytsearch".to_owned(),
            target,
        ]
    }
}

#[async_trait]
impl TrackResolver for YtDlpResolver {
    async fn resolve(&self, query: &str) -> Result<ResolvedTrack, ResolveError> {
        debug!("Resolving \"{}\" with {}", query, self.program);

        let child = Command::new(&self.program)
            .args(self.args(query))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ResolveError::Timeout(self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
            return Err(ResolveError::Failed {
                status: output.status.to_string(),
                stderr,
            });
        }

        let resolved = parse_info(query, &output.stdout)?;
        info!("Resolved \"{}\" to \"{}\"", query, resolved.title);
        Ok(resolved)
    }
}

/// Subset of the yt-dlp info dictionary that we care about.
#[derive(Debug, Default, Deserialize)]
struct VideoInfo {
    #[serde(default)]
    entries: Option<Vec<VideoInfo>>,
    title: Option<String>,
    duration: Option<f64>,
    webpage_url: Option<String>,
    original_url: Option<String>,
    url: Option<String>,
    acodec: Option<String>,
    #[serde(default)]
    formats: Vec<FormatInfo>,
}

#[derive(Debug, Default, Deserialize)]
struct FormatInfo {
    url: Option<String>,
    acodec: Option<String>,
    vcodec: Option<String>,
}

/// yt-dlp reports a missing codec as `"none"`.
fn has_codec(codec: Option<&str>) -> bool {
    codec.is_some_and(|c| !c.is_empty() && c != "none")
}

/// Extracts the playable track from yt-dlp's JSON output.
fn parse_info(query: &str, json: &[u8]) -> Result<ResolvedTrack, ResolveError> {
    let mut info: VideoInfo = serde_json::from_slice(json)?;

    if let Some(entries) = info.entries.take() {
        info = entries
            .into_iter()
            .next()
            .ok_or_else(|| ResolveError::NoResults(query.to_owned()))?;
    }

    let title = info
        .title
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "Unknown".to_owned());

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let duration = info
        .duration
        .map(|d| d as u64)
        .filter(|&d| d > 0)
        .map(format_duration);

    let page_url = info
        .webpage_url
        .or(info.original_url)
        .unwrap_or_else(|| query.to_owned());

    let direct = info
        .url
        .filter(|u| !u.is_empty() && has_codec(info.acodec.as_deref()));

    let stream_url = direct
        .or_else(|| {
            info.formats
                .iter()
                .find(|f| has_codec(f.acodec.as_deref()) && !has_codec(f.vcodec.as_deref()))
                .or_else(|| info.formats.last())
                .and_then(|f| f.url.clone())
        })
        .filter(|u| !u.is_empty())
        .ok_or(ResolveError::NoStream)?;

    Ok(ResolvedTrack {
        stream_url,
        title,
        duration,
        page_url,
    })
}
