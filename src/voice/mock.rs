//! Mock implementation of the [`VoiceCalls`] trait for testing.
//!
//! [`MockVoiceCalls`] keeps per-chat stream state in memory and records
//! every call it receives. Tests can script failures for the next `join`
//! or `change_stream`, and end a chat's stream with [`MockVoiceCalls::finish`].

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};

use super::{ChatId, VoiceCalls, VoiceError};

/// A call recorded by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceEvent {
    Join(ChatId, String),
    ChangeStream(ChatId, String),
    Pause(ChatId),
    Resume(ChatId),
    Leave(ChatId),
}

#[derive(Debug)]
struct MockStream {
    url: String,
    paused: bool,
    finished: watch::Sender<bool>,
}

#[derive(Debug, Default)]
struct MockInner {
    streams: HashMap<ChatId, MockStream>,
    events: Vec<VoiceEvent>,
    join_failures: VecDeque<VoiceError>,
    change_failures: VecDeque<VoiceError>,
}

/// In-memory voice backend.
#[derive(Debug, Default)]
pub struct MockVoiceCalls {
    inner: Mutex<MockInner>,
}

impl MockVoiceCalls {
    /// Creates an empty mock backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `join` fail with `err`.
    pub async fn fail_next_join(&self, err: VoiceError) {
        self.inner.lock().await.join_failures.push_back(err);
    }

    /// Makes the next `change_stream` fail with `err`.
    pub async fn fail_next_change(&self, err: VoiceError) {
        self.inner.lock().await.change_failures.push_back(err);
    }

    /// Ends the chat's current stream as if it played to completion.
    pub async fn finish(&self, chat: ChatId) {
        if let Some(stream) = self.inner.lock().await.streams.get(&chat) {
            stream.finished.send_replace(true);
        }
    }

    /// Returns all recorded calls.
    pub async fn events(&self) -> Vec<VoiceEvent> {
        self.inner.lock().await.events.clone()
    }

    /// URL currently streaming in the chat.
    pub async fn current_url(&self, chat: ChatId) -> Option<String> {
        self.inner
            .lock()
            .await
            .streams
            .get(&chat)
            .map(|s| s.url.clone())
    }

    /// Whether the chat's stream is paused.
    pub async fn is_paused(&self, chat: ChatId) -> bool {
        self.inner
            .lock()
            .await
            .streams
            .get(&chat)
            .is_some_and(|s| s.paused)
    }

    fn new_stream(url: &str) -> MockStream {
        let (finished, _) = watch::channel(false);
        MockStream {
            url: url.to_owned(),
            paused: false,
            finished,
        }
    }
}

#[async_trait]
impl VoiceCalls for MockVoiceCalls {
    async fn join(&self, chat: ChatId, stream_url: &str) -> Result<(), VoiceError> {
        let mut inner = self.inner.lock().await;
        inner.events.push(VoiceEvent::Join(chat, stream_url.to_owned()));

        if let Some(err) = inner.join_failures.pop_front() {
            return Err(err);
        }
        if inner.streams.contains_key(&chat) {
            return Err(VoiceError::AlreadyJoined);
        }

        inner.streams.insert(chat, Self::new_stream(stream_url));
        Ok(())
    }

    async fn change_stream(&self, chat: ChatId, stream_url: &str) -> Result<(), VoiceError> {
        let mut inner = self.inner.lock().await;
        inner
            .events
            .push(VoiceEvent::ChangeStream(chat, stream_url.to_owned()));

        if let Some(err) = inner.change_failures.pop_front() {
            return Err(err);
        }
        let Some(old) = inner.streams.remove(&chat) else {
            return Err(VoiceError::NotInGroupCall);
        };
        // Wake anyone waiting on the replaced stream.
        old.finished.send_replace(true);

        inner.streams.insert(chat, Self::new_stream(stream_url));
        Ok(())
    }

    async fn pause(&self, chat: ChatId) -> Result<(), VoiceError> {
        let mut inner = self.inner.lock().await;
        inner.events.push(VoiceEvent::Pause(chat));
        let stream = inner
            .streams
            .get_mut(&chat)
            .ok_or(VoiceError::NotInGroupCall)?;
        stream.paused = true;
        Ok(())
    }

    async fn resume(&self, chat: ChatId) -> Result<(), VoiceError> {
        let mut inner = self.inner.lock().await;
        inner.events.push(VoiceEvent::Resume(chat));
        let stream = inner
            .streams
            .get_mut(&chat)
            .ok_or(VoiceError::NotInGroupCall)?;
        stream.paused = false;
        Ok(())
    }

    async fn leave(&self, chat: ChatId) -> Result<(), VoiceError> {
        let mut inner = self.inner.lock().await;
        inner.events.push(VoiceEvent::Leave(chat));
        let stream = inner
            .streams
            .remove(&chat)
            .ok_or(VoiceError::NotInGroupCall)?;
        stream.finished.send_replace(true);
        Ok(())
    }

    async fn is_active(&self, chat: ChatId) -> bool {
        self.inner
            .lock()
            .await
            .streams
            .get(&chat)
            .is_some_and(|s| !*s.finished.borrow())
    }

    async fn wait_finished(&self, chat: ChatId) {
        let finished = self
            .inner
            .lock()
            .await
            .streams
            .get(&chat)
            .map(|s| s.finished.subscribe());

        if let Some(mut finished) = finished {
            let _ = finished.wait_for(|f| *f).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_join_twice_is_already_joined() {
        let mock = MockVoiceCalls::new();
        mock.join(1, "a").await.unwrap();
        assert_eq!(mock.join(1, "b").await, Err(VoiceError::AlreadyJoined));
        assert_eq!(mock.current_url(1).await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_scripted_failure_is_consumed_once() {
        let mock = MockVoiceCalls::new();
        mock.fail_next_join(VoiceError::GroupCallNotFound).await;
        assert_eq!(mock.join(1, "a").await, Err(VoiceError::GroupCallNotFound));
        assert!(mock.join(1, "a").await.is_ok());
    }

    #[tokio::test]
    async fn test_pause_resume() {
        let mock = MockVoiceCalls::new();
        assert_eq!(mock.pause(1).await, Err(VoiceError::NotInGroupCall));
        mock.join(1, "a").await.unwrap();
        mock.pause(1).await.unwrap();
        assert!(mock.is_paused(1).await);
        mock.resume(1).await.unwrap();
        assert!(!mock.is_paused(1).await);
    }

    #[tokio::test]
    async fn test_finish_wakes_waiter() {
        let mock = Arc::new(MockVoiceCalls::new());
        mock.join(7, "a").await.unwrap();

        let waiter = {
            let mock = Arc::clone(&mock);
            tokio::spawn(async move { mock.wait_finished(7).await })
        };

        tokio::task::yield_now().await;
        mock.finish(7).await;

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(!mock.is_active(7).await);
    }
}
