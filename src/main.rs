//! Krishnavi Music Bot - Main Entry Point
//!
//! A Telegram bot that plays queued songs in group voice chats.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use krishnavi_music_bot::commands::CommandHandler;
use krishnavi_music_bot::config::{BotSettings, TelegramConfig};
use krishnavi_music_bot::media::YtDlpResolver;
use krishnavi_music_bot::player::{Player, PlayerEvent, PlayerSettings};
use krishnavi_music_bot::telegram::MusicBot;
use krishnavi_music_bot::voice::{FfmpegVoiceCalls, PcmFileSink, VoiceCalls};

/// Telegram bot that plays songs in voice chats with queue support.
#[derive(Parser, Debug)]
#[command(name = "music_bot")]
#[command(about = "Play songs in Telegram voice chats with a per-chat queue")]
#[command(version)]
struct Args {
    /// Path to the .env file for environment variables.
    #[arg(long, default_value = ".env")]
    env_file: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level);

    // Load environment variables
    if let Err(e) = dotenvy::from_filename(&args.env_file) {
        debug!("Could not load .env file ({}): {}", args.env_file, e);
    }

    // Load configurations
    let tg_config = TelegramConfig::from_env()
        .context("Please set API_ID, API_HASH, BOT_TOKEN in environment")?;

    let settings = BotSettings::from_env_with_defaults();
    debug!("Settings: {:?}", settings);

    info!("Starting Krishnavi Music Bot…");

    // Connect to Telegram
    let (bot, mut updates) = MusicBot::connect(&tg_config, settings.reply_min_interval())
        .await
        .context("Failed to connect to Telegram")?;

    bot.ensure_bot_sign_in(&tg_config)
        .await
        .context("Bot sign in failed")?;

    let username = match bot.username().await {
        Ok(name) => name,
        Err(e) => {
            warn!("Could not fetch bot username: {}", e);
            None
        }
    };
    info!("Signed in as @{}", username.as_deref().unwrap_or("<unknown>"));

    // Playback stack
    let sink = Arc::new(PcmFileSink::new(settings.pcm_dir.clone()));
    let voice: Arc<dyn VoiceCalls> = Arc::new(FfmpegVoiceCalls::new(settings.ffmpeg_path.clone(), sink));

    let (events_tx, events_rx) = mpsc::channel::<PlayerEvent>(32);
    let player = Player::with_events(
        voice,
        PlayerSettings::from_bot_settings(&settings),
        events_tx,
    );

    let resolver = Arc::new(YtDlpResolver::from_settings(&settings));
    let handler = Arc::new(CommandHandler::new(player.clone(), resolver).with_username(username));

    let bot = Arc::new(bot);

    // Spawn notification forwarder
    let events_handle = {
        let bot = Arc::clone(&bot);
        tokio::spawn(async move {
            bot.run_events(events_rx).await;
        })
    };

    info!("Bot is running. Press Ctrl+C to stop.");

    tokio::select! {
        result = bot.run(Arc::clone(&handler), &mut updates) => {
            if let Err(e) = result {
                error!("Update stream failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    // Cleanup
    info!("Shutting down...");
    player.shutdown().await;
    events_handle.abort();
    bot.disconnect();

    Ok(())
}

/// Initializes the logging subsystem.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
