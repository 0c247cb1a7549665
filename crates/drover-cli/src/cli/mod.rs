//! CLI argument parsing and dispatch.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "drover", version, about = "Multi-source download manager")]
pub struct CliCommand {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download URLs to completion.
    Fetch {
        /// URLs to download.
        #[arg(required = true)]
        urls: Vec<String>,
        /// Output directory (defaults to the configured storage folder).
        #[arg(long)]
        out: Option<std::path::PathBuf>,
        /// Parallel chunks per file.
        #[arg(long)]
        chunks: Option<usize>,
        /// Parallel downloads.
        #[arg(long)]
        max_downloads: Option<usize>,
        /// Bandwidth cap in KiB/s.
        #[arg(long)]
        limit_rate: Option<i64>,
    },
    /// Probe online status of URLs without downloading.
    Check {
        #[arg(required = true)]
        urls: Vec<String>,
    },
}

impl CliCommand {
    pub async fn run_from_args() -> Result<()> {
        let cli = CliCommand::parse();
        match cli.command {
            Command::Fetch {
                urls,
                out,
                chunks,
                max_downloads,
                limit_rate,
            } => commands::fetch::run(urls, out, chunks, max_downloads, limit_rate).await,
            Command::Check { urls } => commands::check::run(urls).await,
        }
    }
}
