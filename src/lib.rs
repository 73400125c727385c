//! Krishnavi Music Bot Library
//!
//! A Telegram bot that plays songs in group voice chats.
//!
//! This crate provides the core functionality for:
//! - Loading credentials and settings from the environment
//! - Resolving search queries and URLs to audio streams via `yt-dlp`
//! - Streaming audio into voice chats through FFmpeg
//! - Keeping a queue and play loop per chat
//! - Handling user commands via chat messages

pub mod commands;
pub mod config;
pub mod media;
pub mod player;
pub mod telegram;
pub mod voice;
