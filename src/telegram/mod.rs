//! Telegram client wrapper module.
//!
//! Connects to Telegram as a bot, turns incoming messages into commands,
//! and delivers replies and player notifications with rate limiting.

mod client;
mod rate_limiter;

pub use client::{MusicBot, TelegramError, UpdateStream};
pub use rate_limiter::RateLimiter;
