use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "kash-stash", version, about = "kash-stash distributed work-queue agent")]
pub struct Cli {
    /// Path to the endpoint configuration file (defaults to
    /// `~/.kash_stash_config.json`).
    #[arg(long, env = "KASH_STASH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory for local claim lockfiles (defaults to
    /// `~/.kash_stash_locks`).
    #[arg(long, env = "KASH_STASH_LOCK_ROOT")]
    pub lock_root: Option<PathBuf>,
}
