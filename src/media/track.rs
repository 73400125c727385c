//! Queued track representation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ResolvedTrack;

/// A track waiting in (or playing from) a chat queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    /// Display title.
    pub title: String,

    /// Direct audio stream URL handed to the voice backend.
    pub stream_url: String,

    /// Original page or video URL.
    pub page_url: String,

    /// Markdown mention of whoever queued the track.
    pub requester: String,

    /// Formatted duration, when known.
    pub duration: Option<String>,

    /// When the track was queued.
    pub queued_at: DateTime<Utc>,
}

impl Track {
    /// Builds a track from a resolver result.
    #[must_use]
    pub fn from_resolved(resolved: ResolvedTrack, requester: impl Into<String>) -> Self {
        Self {
            title: resolved.title,
            stream_url: resolved.stream_url,
            page_url: resolved.page_url,
            requester: requester.into(),
            duration: resolved.duration,
            queued_at: Utc::now(),
        }
    }

    /// Title followed by the duration tag when a duration is known.
    #[must_use]
    pub fn label(&self) -> String {
        match &self.duration {
            Some(d) => format!("{} `[{d}]`", self.title),
            None => self.title.clone(),
        }
    }
}

/// Formats seconds as `H:MM:SS`, or `M:SS` below one hour.
#[must_use]
pub fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let rest = secs % 60;
    if hours > 0 {
        format!("{hours}:{mins:02}:{rest:02}")
    } else {
        format!("{mins}:{rest:02}")
    }
}

/// Checks whether a query is an http(s) URL rather than a search phrase.
#[must_use]
pub fn is_url(query: &str) -> bool {
    let lower = query.to_ascii_lowercase();
    let rest = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"));

    match rest {
        Some(rest) => rest.chars().next().is_some_and(|c| !c.is_whitespace()),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "0:00");
        assert_eq!(format_duration(59), "0:59");
        assert_eq!(format_duration(61), "1:01");
        assert_eq!(format_duration(3600), "1:00:00");
        assert_eq!(format_duration(3725), "1:02:05");
    }

    #[test]
    fn test_is_url() {
        assert!(is_url("https://youtu.be/abc"));
        assert!(is_url("HTTP://example.com"));
        assert!(!is_url("https://"));
        assert!(!is_url("https:// spaced"));
        assert!(!is_url("never gonna give you up"));
        assert!(!is_url("ftp://example.com"));
    }

    #[test]
    fn test_label() {
        let mut track = Track::from_resolved(
            ResolvedTrack {
                stream_url: "s".to_owned(),
                title: "Song".to_owned(),
                duration: Some("3:45".to_owned()),
                page_url: "p".to_owned(),
            },
            "Someone",
        );
        assert_eq!(track.label(), "Song `[3:45]`");

        track.duration = None;
        assert_eq!(track.label(), "Song");
    }
}
