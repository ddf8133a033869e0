//! panbd command-line entry point.

mod app;
mod config;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Resumable concurrent transfers for Baidu Netdisk.
#[derive(Debug, Parser)]
#[command(name = "panbd", version)]
pub struct Cli {
    /// Configuration file (defaults to the per-user location).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Worker pool size.
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Download a remote file.
    Download {
        /// Absolute remote path.
        remote: String,
        /// Local destination file.
        local: PathBuf,
        /// Replace an existing local file and its resume metadata.
        #[arg(long)]
        overwrite: bool,
        /// Fetch every block again even if resume metadata marks it done.
        #[arg(long)]
        recheck: bool,
        /// Block size in MiB (1 to 100).
        #[arg(long)]
        block_size: Option<u64>,
    },
    /// Download every file below a remote directory, keeping its layout.
    DownloadDir {
        /// Absolute remote directory.
        remote: String,
        /// Local directory that receives the tree.
        local: PathBuf,
        /// Replace existing local files and their resume metadata.
        #[arg(long)]
        overwrite: bool,
        /// Fetch every block again even if resume metadata marks it done.
        #[arg(long)]
        recheck: bool,
        /// Block size in MiB (1 to 100).
        #[arg(long)]
        block_size: Option<u64>,
    },
    /// Upload a local file into the application folder.
    Upload {
        /// Local source file.
        local: PathBuf,
        /// Remote path, relative to `/apps/{app_name}` or absolute inside it.
        remote: String,
        /// Naming-conflict policy (0 fail, 1 rename, 2 rename on differing content, 3 overwrite).
        #[arg(long)]
        rename_policy: Option<u8>,
    },
    /// List a remote directory.
    List {
        #[arg(default_value = "/")]
        dir: String,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let path = cli.config.clone().unwrap_or_else(config::config_path);
    let mut config = config::Config::load(&path)?;
    config.apply_env(|key| std::env::var(key).ok())?;
    tracing::debug!(path = %path.display(), "configuration loaded");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(cli, config, path))
}
