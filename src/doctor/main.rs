//! Standalone environment checker for the music bot.
//!
//! Verifies that credentials are present, that `yt-dlp` and `ffmpeg` can be
//! executed, and that the PCM output directory is writable. Optionally
//! resolves a query end to end.

use std::process::{ExitCode, Stdio};

use clap::Parser;
use tokio::process::Command;

use krishnavi_music_bot::config::{BotSettings, TelegramConfig};
use krishnavi_music_bot::media::{TrackResolver, YtDlpResolver};

/// Music bot environment checker.
#[derive(Parser, Debug)]
#[command(name = "music_bot_doctor")]
#[command(about = "Checks that the music bot's environment is ready")]
#[command(version)]
struct Args {
    /// Path to the .env file for environment variables.
    #[arg(long, default_value = ".env")]
    env_file: String,

    /// Resolve this query with yt-dlp and print the result.
    #[arg(short, long)]
    resolve: Option<String>,

    /// Show the effective settings.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let _ = dotenvy::from_filename(&args.env_file);
    let settings = BotSettings::from_env_with_defaults();

    if args.verbose {
        println!("Effective settings: {settings:#?}\n");
    }

    let mut errors = 0;

    match TelegramConfig::from_env() {
        Ok(config) => println!(
            "✓ Telegram credentials present (session: {})",
            config.session_path().display()
        ),
        Err(e) => {
            errors += 1;
            println!("✗ {e}");
        }
    }

    errors += check_binary("yt-dlp", &settings.ytdlp_path, "--version").await;
    errors += check_binary("ffmpeg", &settings.ffmpeg_path, "-version").await;

    match check_writable(&settings).await {
        Ok(()) => println!("✓ PCM directory writable: {}", settings.pcm_dir.display()),
        Err(e) => {
            errors += 1;
            println!("✗ PCM directory {} not writable: {e}", settings.pcm_dir.display());
        }
    }

    if let Some(query) = args.resolve {
        let resolver = YtDlpResolver::from_settings(&settings);
        println!("\nResolving: {query}");
        match resolver.resolve(&query).await {
            Ok(track) => {
                println!("  Title:    {}", track.title);
                println!("  Duration: {}", track.duration.as_deref().unwrap_or("unknown"));
                println!("  Page:     {}", track.page_url);
                println!("  Stream:   {}", truncate(&track.stream_url, 60));
            }
            Err(e) => {
                errors += 1;
                println!("  ✗ {e}");
            }
        }
    }

    println!();
    if errors == 0 {
        println!("✓ Environment looks ready");
        ExitCode::SUCCESS
    } else {
        println!("✗ {errors} problem(s) found");
        ExitCode::FAILURE
    }
}

/// Runs `program flag` and reports the first line of its output.
async fn check_binary(label: &str, program: &str, flag: &str) -> usize {
    let output = Command::new(program)
        .arg(flag)
        .stdin(Stdio::null())
        .output()
        .await;

    match output {
        Ok(out) if out.status.success() => {
            let stdout = String::from_utf8_lossy(&out.stdout);
            let version = stdout.lines().next().unwrap_or("").trim();
            println!("✓ {label} available: {}", truncate(version, 60));
            0
        }
        Ok(out) => {
            println!("✗ {label} ({program}) exited with {}", out.status);
            1
        }
        Err(e) => {
            println!("✗ {label} ({program}) not runnable: {e}");
            1
        }
    }
}

async fn check_writable(settings: &BotSettings) -> std::io::Result<()> {
    tokio::fs::create_dir_all(&settings.pcm_dir).await?;
    let probe = settings.pcm_dir.join(".doctor-probe");
    tokio::fs::write(&probe, b"ok").await?;
    tokio::fs::remove_file(&probe).await
}

/// Truncates a string for display.
fn truncate(s: &str, max_len: usize) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= max_len {
        s.to_owned()
    } else {
        format!("{}...", chars[..max_len].iter().collect::<String>())
    }
}
