//! Track model and stream resolution.
//!
//! Turns a free-form search query or a page URL into a playable
//! audio stream URL by shelling out to `yt-dlp`.

mod resolver;
mod track;

pub use resolver::{ResolveError, ResolvedTrack, TrackResolver, YtDlpResolver};
pub use track::{Track, format_duration, is_url};
