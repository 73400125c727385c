//! Command handling module.
//!
//! Processes slash commands sent to the bot in Telegram chats.

mod handler;
mod types;

pub use handler::{CommandHandler, NO_VOICE_CHAT_TEXT};
pub use types::{BotCommand, CommandResult, IncomingCommand, Requester, SEARCHING_MESSAGE};
