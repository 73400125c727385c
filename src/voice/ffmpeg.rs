//! FFmpeg-driven voice backend.
//!
//! Each active chat owns one FFmpeg child that decodes the stream URL to
//! raw PCM (s16le, 48 kHz, stereo). A pump task reads 20 ms frames from
//! FFmpeg's stdout and forwards them to the chat's sink writer at
//! real-time pace, which is what a call bridge expects to consume.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use super::{ChatId, VoiceCalls, VoiceError};

/// Output sample rate in Hz.
pub const SAMPLE_RATE: u32 = 48_000;

/// Output channel count.
pub const CHANNELS: u32 = 2;

/// Duration of one forwarded frame.
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Bytes in one 20 ms s16le frame.
pub const FRAME_BYTES: usize = (SAMPLE_RATE as usize / 50) * CHANNELS as usize * 2;

/// Destination for a chat's decoded audio.
#[async_trait]
pub trait FrameSink: Send + Sync + 'static {
    /// Opens a writer for the chat's call.
    ///
    /// Returns [`VoiceError::GroupCallNotFound`] when the chat has no call
    /// to stream into.
    async fn open(&self, chat: ChatId) -> Result<Box<dyn AsyncWrite + Send + Unpin>, VoiceError>;
}

/// Sink that writes each chat's PCM to `<dir>/<chat_id>.pcm`.
///
/// The path may be a named pipe owned by an external call bridge.
#[derive(Debug, Clone)]
pub struct PcmFileSink {
    dir: PathBuf,
}

impl PcmFileSink {
    /// Creates a sink rooted at `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path the chat's stream is written to.
    #[must_use]
    pub fn path_for(&self, chat: ChatId) -> PathBuf {
        self.dir.join(format!("{chat}.pcm"))
    }
}

#[async_trait]
impl FrameSink for PcmFileSink {
    async fn open(&self, chat: ChatId) -> Result<Box<dyn AsyncWrite + Send + Unpin>, VoiceError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| VoiceError::Backend(format!("cannot create {}: {e}", self.dir.display())))?;

        let path = self.path_for(chat);
        let file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| VoiceError::Backend(format!("cannot open {}: {e}", path.display())))?;

        debug!("Streaming chat {} to {}", chat, path.display());
        Ok(Box::new(file))
    }
}

/// A running stream in one chat.
struct ActiveStream {
    url: String,
    paused: watch::Sender<bool>,
    finished: watch::Receiver<bool>,
    pump: JoinHandle<()>,
}

impl ActiveStream {
    fn stop(self) {
        self.pump.abort();
    }
}

/// Voice backend that decodes streams with FFmpeg.
pub struct FfmpegVoiceCalls {
    ffmpeg: String,
    sink: Arc<dyn FrameSink>,
    streams: Mutex<HashMap<ChatId, ActiveStream>>,
}

impl FfmpegVoiceCalls {
    /// Creates a backend using the given FFmpeg executable and sink.
    #[must_use]
    pub fn new(ffmpeg: impl Into<String>, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            sink,
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// FFmpeg arguments that decode `url` to raw PCM on stdout.
    fn ffmpeg_args(url: &str) -> Vec<String> {
        [
            "-nostdin",
            "-loglevel",
            "error",
            "-reconnect",
            "1",
            "-reconnect_streamed",
            "1",
            "-reconnect_delay_max",
            "5",
            "-i",
            url,
            "-vn",
            "-f",
            "s16le",
            "-acodec",
            "pcm_s16le",
            "-ac",
            "2",
            "-ar",
            "48000",
            "pipe:1",
        ]
        .iter()
        .map(|s| (*s).to_owned())
        .collect()
    }

    /// Spawns FFmpeg and the pump task for a chat.
    async fn start(&self, chat: ChatId, url: &str) -> Result<ActiveStream, VoiceError> {
        let writer = self.sink.open(chat).await?;

        let mut child = Command::new(&self.ffmpeg)
            .args(Self::ffmpeg_args(url))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VoiceError::Backend(format!("failed to start ffmpeg: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| VoiceError::Backend("ffmpeg stdout unavailable".to_owned()))?;

        let stderr = child.stderr.take();

        let (paused_tx, paused_rx) = watch::channel(false);
        let (finished_tx, finished_rx) = watch::channel(false);

        // The pump owns the child; aborting it kills FFmpeg.
        let pump = tokio::spawn(async move {
            let stderr_task = stderr.map(|mut stderr| {
                tokio::spawn(async move {
                    let mut text = String::new();
                    let _ = stderr.read_to_string(&mut text).await;
                    text
                })
            });

            let forwarded = pump_frames(stdout, writer, paused_rx).await;
            let status = child.wait().await.ok();
            let stderr = match stderr_task {
                Some(task) => task.await.unwrap_or_default(),
                None => String::new(),
            };

            match forwarded {
                Ok(bytes) => match stream_failure(bytes, status, &stderr) {
                    Some(reason) => warn!("Stream in chat {} failed: {}", chat, reason),
                    None => debug!("Stream in chat {} ended after {} bytes", chat, bytes),
                },
                Err(e) => warn!("Stream in chat {} stopped: {}", chat, e),
            }
            let _ = finished_tx.send(true);
        });

        Ok(ActiveStream {
            url: url.to_owned(),
            paused: paused_tx,
            finished: finished_rx,
            pump,
        })
    }

    /// Records a chat's new stream, stopping whatever it replaces.
    async fn install(&self, chat: ChatId, stream: ActiveStream) {
        let replaced = self.streams.lock().await.insert(chat, stream);
        if let Some(old) = replaced {
            old.stop();
        }
    }
}

/// Describes why a finished stream counts as failed, if it does.
///
/// A stream fails when FFmpeg exited non-zero or decoded nothing at all.
/// The last line FFmpeg printed is appended as the reason.
fn stream_failure(bytes: u64, status: Option<ExitStatus>, stderr: &str) -> Option<String> {
    let bad_exit = status.filter(|s| !s.success());
    if bytes > 0 && bad_exit.is_none() {
        return None;
    }

    let mut reason = match bad_exit {
        Some(status) => format!("ffmpeg {status} after {bytes} bytes"),
        None => "no audio decoded".to_owned(),
    };
    if let Some(line) = stderr.lines().rev().map(str::trim).find(|l| !l.is_empty()) {
        reason.push_str(": ");
        reason.push_str(line);
    }
    Some(reason)
}

/// Copies PCM frames from `reader` to `writer`, one frame per tick.
///
/// Returns the total number of bytes forwarded once the reader is exhausted.
async fn pump_frames<R, W>(
    mut reader: R,
    mut writer: W,
    mut paused: watch::Receiver<bool>,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut ticker = interval(FRAME_DURATION);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut frame = vec![0u8; FRAME_BYTES];
    let mut total = 0u64;

    loop {
        if *paused.borrow() {
            // Sender gone means the stream was torn down.
            if paused.wait_for(|p| !*p).await.is_err() {
                break;
            }
            ticker.reset();
        }

        ticker.tick().await;

        let filled = read_frame(&mut reader, &mut frame).await?;
        if filled == 0 {
            break;
        }

        writer.write_all(&frame[..filled]).await?;
        total += filled as u64;
    }

    writer.flush().await?;
    Ok(total)
}

/// Reads up to one full frame, returning fewer bytes only at end of stream.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, frame: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < frame.len() {
        let n = reader.read(&mut frame[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[async_trait]
impl VoiceCalls for FfmpegVoiceCalls {
    async fn join(&self, chat: ChatId, stream_url: &str) -> Result<(), VoiceError> {
        {
            let streams = self.streams.lock().await;
            if let Some(active) = streams.get(&chat)
                && !*active.finished.borrow()
            {
                return Err(VoiceError::AlreadyJoined);
            }
        }

        // Opening the sink may block on a FIFO; other chats must not wait on it.
        let stream = self.start(chat, stream_url).await?;
        self.install(chat, stream).await;
        info!("Joined voice chat {}", chat);
        Ok(())
    }

    async fn change_stream(&self, chat: ChatId, stream_url: &str) -> Result<(), VoiceError> {
        let old = self
            .streams
            .lock()
            .await
            .remove(&chat)
            .ok_or(VoiceError::NotInGroupCall)?;
        debug!("Changing stream in chat {} (was {})", chat, old.url);
        old.stop();

        let stream = self.start(chat, stream_url).await?;
        self.install(chat, stream).await;
        Ok(())
    }

    async fn pause(&self, chat: ChatId) -> Result<(), VoiceError> {
        let streams = self.streams.lock().await;
        let active = streams.get(&chat).ok_or(VoiceError::NotInGroupCall)?;
        active.paused.send_replace(true);
        Ok(())
    }

    async fn resume(&self, chat: ChatId) -> Result<(), VoiceError> {
        let streams = self.streams.lock().await;
        let active = streams.get(&chat).ok_or(VoiceError::NotInGroupCall)?;
        active.paused.send_replace(false);
        Ok(())
    }

    async fn leave(&self, chat: ChatId) -> Result<(), VoiceError> {
        let stream = self
            .streams
            .lock()
            .await
            .remove(&chat)
            .ok_or(VoiceError::NotInGroupCall)?;
        stream.stop();
        info!("Left voice chat {}", chat);
        Ok(())
    }

    async fn is_active(&self, chat: ChatId) -> bool {
        self.streams
            .lock()
            .await
            .get(&chat)
            .is_some_and(|s| !*s.finished.borrow())
    }

    async fn wait_finished(&self, chat: ChatId) {
        let finished = self
            .streams
            .lock()
            .await
            .get(&chat)
            .map(|s| s.finished.clone());

        if let Some(mut finished) = finished {
            let _ = finished.wait_for(|f| *f).await;
        }
    }
}

impl std::fmt::Debug for FfmpegVoiceCalls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FfmpegVoiceCalls")
            .field("ffmpeg", &self.ffmpeg)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size() {
        // 960 samples per channel, two channels, two bytes each.
        assert_eq!(FRAME_BYTES, 3840);
    }

    #[test]
    fn test_ffmpeg_args_target_raw_pcm() {
        let args = FfmpegVoiceCalls::ffmpeg_args("https://cdn/a.webm");
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[input + 1], "https://cdn/a.webm");
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
        assert!(args.windows(2).any(|w| w[0] == "-ar" && w[1] == "48000"));
    }

    #[test]
    fn test_pcm_path() {
        let sink = PcmFileSink::new("/tmp/voice");
        assert_eq!(sink.path_for(-100_123), PathBuf::from("/tmp/voice/-100123.pcm"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pump_forwards_everything() {
        let input = vec![7u8; FRAME_BYTES * 2 + 100];
        let (_tx, paused) = watch::channel(false);
        let mut out = Vec::new();

        let total = pump_frames(input.as_slice(), &mut out, paused).await.unwrap();
        assert_eq!(total, input.len() as u64);
        assert_eq!(out, input);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pump_stops_when_pause_sender_dropped() {
        let input = vec![1u8; FRAME_BYTES * 4];
        let (tx, paused) = watch::channel(true);
        drop(tx);
        let mut out = Vec::new();

        let total = pump_frames(input.as_slice(), &mut out, paused).await.unwrap();
        assert_eq!(total, 0);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_pcm_sink_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let sink = PcmFileSink::new(dir.path().join("nested"));
        let mut writer = sink.open(42).await.unwrap();
        writer.write_all(&[1, 2, 3]).await.unwrap();
        writer.flush().await.unwrap();
        drop(writer);

        let written = std::fs::read(sink.path_for(42)).unwrap();
        assert_eq!(written, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_control_without_stream_is_not_in_call() {
        let backend = FfmpegVoiceCalls::new("ffmpeg", Arc::new(PcmFileSink::new("unused")));
        assert_eq!(backend.pause(1).await, Err(VoiceError::NotInGroupCall));
        assert_eq!(backend.resume(1).await, Err(VoiceError::NotInGroupCall));
        assert_eq!(backend.leave(1).await, Err(VoiceError::NotInGroupCall));
        assert_eq!(
            backend.change_stream(1, "x").await,
            Err(VoiceError::NotInGroupCall)
        );
        assert!(!backend.is_active(1).await);
        backend.wait_finished(1).await;
    }

    /// Sink whose `open` never completes for chat 1, like a FIFO nobody reads.
    struct StuckSink;

    #[async_trait]
    impl FrameSink for StuckSink {
        async fn open(&self, chat: ChatId) -> Result<Box<dyn AsyncWrite + Send + Unpin>, VoiceError> {
            if chat == 1 {
                std::future::pending::<()>().await;
            }
            Err(VoiceError::GroupCallNotFound)
        }
    }

    #[tokio::test]
    async fn test_slow_sink_does_not_block_other_chats() {
        let backend = Arc::new(FfmpegVoiceCalls::new("ffmpeg", Arc::new(StuckSink)));

        let joining = {
            let backend = Arc::clone(&backend);
            tokio::spawn(async move { backend.join(1, "https://cdn/a").await })
        };
        tokio::task::yield_now().await;

        let other_chat = tokio::time::timeout(Duration::from_secs(2), async {
            assert!(!backend.is_active(2).await);
            assert_eq!(backend.pause(2).await, Err(VoiceError::NotInGroupCall));
            assert_eq!(backend.leave(2).await, Err(VoiceError::NotInGroupCall));
            backend.wait_finished(2).await;
        })
        .await;

        assert!(other_chat.is_ok());
        assert!(!joining.is_finished());
        joining.abort();
    }

    #[tokio::test]
    async fn test_join_on_active_chat_is_already_joined() {
        let backend = FfmpegVoiceCalls::new("ffmpeg", Arc::new(PcmFileSink::new("unused")));
        let (paused, _) = watch::channel(false);
        let (_finished_tx, finished) = watch::channel(false);
        backend.streams.lock().await.insert(
            5,
            ActiveStream {
                url: "https://cdn/a".to_owned(),
                paused,
                finished,
                pump: tokio::spawn(std::future::pending::<()>()),
            },
        );

        assert_eq!(
            backend.join(5, "https://cdn/b").await,
            Err(VoiceError::AlreadyJoined)
        );
        assert!(backend.is_active(5).await);

        backend.leave(5).await.unwrap();
        assert!(!backend.is_active(5).await);
    }

    #[test]
    fn test_stream_failure_reasons() {
        assert_eq!(stream_failure(FRAME_BYTES as u64, None, ""), None);
        assert_eq!(
            stream_failure(0, None, "\nhttps://cdn/a: Server returned 403 Forbidden\n\n"),
            Some("no audio decoded: https://cdn/a: Server returned 403 Forbidden".to_owned())
        );
        assert_eq!(stream_failure(0, None, ""), Some("no audio decoded".to_owned()));
    }

    #[cfg(unix)]
    #[test]
    fn test_stream_failure_on_bad_exit() {
        use std::os::unix::process::ExitStatusExt;

        let failed = ExitStatus::from_raw(1 << 8);
        let reason = stream_failure(100, Some(failed), "Invalid data found").unwrap();
        assert!(reason.starts_with("ffmpeg exit status: 1 after 100 bytes"));
        assert!(reason.ends_with(": Invalid data found"));

        let ok = ExitStatus::from_raw(0);
        assert_eq!(stream_failure(100, Some(ok), "noise"), None);
    }
}
