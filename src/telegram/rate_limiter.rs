//! Rate limiter for outgoing messages.
//!
//! Telegram throttles bots per chat, so each chat gets its own spacing:
//! replies in one busy group never delay another group. A flood wait is
//! account-wide and blocks every chat until it has passed.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};

use crate::voice::ChatId;

#[derive(Debug, Default)]
struct Slots {
    /// Earliest instant each chat may receive its next message.
    next: HashMap<ChatId, Instant>,

    /// No message goes out before this instant.
    blocked_until: Option<Instant>,
}

/// Per-chat rate limiter with a global flood-wait block.
#[derive(Debug)]
pub struct RateLimiter {
    /// Minimum spacing between two messages to the same chat.
    min_interval: Duration,

    slots: Mutex<Slots>,
}

impl RateLimiter {
    /// Creates a limiter spacing messages to a chat by `min_interval`.
    #[must_use]
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            slots: Mutex::new(Slots::default()),
        }
    }

    /// Reserves the chat's next send slot and sleeps until it arrives.
    ///
    /// The lock is released before sleeping, so waiting on one chat never
    /// holds up another. Returns how long the caller waited.
    pub async fn acquire(&self, chat: ChatId) -> Duration {
        let now = Instant::now();
        let ready = {
            let mut slots = self.slots.lock().await;

            if slots.blocked_until.is_some_and(|until| until <= now) {
                slots.blocked_until = None;
            }
            slots.next.retain(|_, slot| *slot > now);

            let mut ready = slots.next.get(&chat).copied().unwrap_or(now).max(now);
            if let Some(until) = slots.blocked_until {
                ready = ready.max(until);
            }
            slots.next.insert(chat, ready + self.min_interval);
            ready
        };

        let wait = ready - now;
        if !wait.is_zero() {
            debug!("Holding message to chat {} for {:?}", chat, wait);
            sleep_until(ready).await;
        }
        wait
    }

    /// Time until the chat may receive a message, without reserving a slot.
    #[cfg(test)]
    async fn time_until_allowed(&self, chat: ChatId) -> Duration {
        let now = Instant::now();
        let slots = self.slots.lock().await;
        let slot = slots.next.get(&chat).copied().unwrap_or(now);
        let ready = slots.blocked_until.map_or(slot, |until| slot.max(until));
        ready.saturating_duration_since(now)
    }

    /// Blocks every chat for `wait_seconds` and sleeps through the block.
    pub async fn handle_flood_wait(&self, wait_seconds: u32) {
        warn!("Flood wait from Telegram: {} seconds", wait_seconds);
        let until = Instant::now() + Duration::from_secs(u64::from(wait_seconds));
        {
            let mut slots = self.slots.lock().await;
            slots.blocked_until = Some(slots.blocked_until.map_or(until, |b| b.max(until)));
        }
        sleep_until(until).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_first_message_is_immediate() {
        let limiter = RateLimiter::new(Duration::from_secs(1));
        assert_eq!(limiter.acquire(1).await, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_chat_is_spaced() {
        let limiter = RateLimiter::new(Duration::from_millis(300));

        limiter.acquire(1).await;
        assert_eq!(limiter.time_until_allowed(1).await, Duration::from_millis(300));

        let waited = limiter.acquire(1).await;
        assert_eq!(waited, Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_chats_are_independent() {
        let limiter = RateLimiter::new(Duration::from_secs(5));

        limiter.acquire(1).await;
        assert_eq!(limiter.acquire(2).await, Duration::ZERO);
        assert!(limiter.time_until_allowed(1).await > Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_senders_get_consecutive_slots() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(100)));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.acquire(7).await })
            })
            .collect();

        let mut waits = Vec::new();
        for handle in handles {
            waits.push(handle.await.unwrap());
        }
        waits.sort();
        assert_eq!(
            waits,
            vec![Duration::ZERO, Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_flood_wait_blocks_other_chats() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(10)));

        let blocker = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.handle_flood_wait(3).await })
        };
        tokio::task::yield_now().await;

        assert!(limiter.time_until_allowed(42).await > Duration::from_secs(2));
        let waited = limiter.acquire(42).await;
        assert!(waited > Duration::from_secs(2));
        blocker.await.unwrap();
    }
}
