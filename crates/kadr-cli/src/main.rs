//! Kadr CLI - Headless HLS player and inspection tool
//!
//! Features:
//! - Manifest inspection (quality ladder)
//! - Scrub preview index parsing and lookup
//! - Headless playback with the virtual surface, printing engine events

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod output;

/// Kadr CLI - Adaptive HLS playback toolkit
#[derive(Parser)]
#[command(name = "kadr")]
#[command(version)]
#[command(about = "Headless adaptive HLS player", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON instead of text (logs and results)
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the quality levels of a manifest
    Inspect {
        /// Manifest URL
        url: String,
    },

    /// Parse a scrub preview index
    Thumbs {
        /// Index URL
        index: String,

        /// Show the preview for this time (seconds)
        #[arg(long)]
        at: Option<f64>,
    },

    /// Play a stream headlessly, printing player events
    Play(commands::PlayArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if cli.json {
        builder.json().init();
    } else {
        builder.init();
    }
    kadr_core::init();

    match cli.command {
        Commands::Inspect { url } => {
            commands::inspect(&url, cli.json).await?;
        }
        Commands::Thumbs { index, at } => {
            commands::thumbs(&index, at, cli.json).await?;
        }
        Commands::Play(args) => {
            commands::play(args, cli.json).await?;
        }
    }

    Ok(())
}

/// Default location of the resume file
pub(crate) fn default_resume_file() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".kadr")
        .join("resume.json")
}
