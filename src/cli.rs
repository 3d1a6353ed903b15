//! Thin command-line surface over the controller.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "runwarden", about = "Guarded local runner for test and build commands")]
pub struct Cli {
    /// State directory (defaults to ./.runwarden).
    #[arg(long, global = true)]
    pub state_dir: Option<std::path::PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one command under the full guard pipeline.
    Run {
        command: String,
        args: Vec<String>,

        /// Absolute timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,

        /// Idle (no-output) timeout in seconds.
        #[arg(long)]
        idle_timeout: Option<u64>,

        /// Cache the result under this key.
        #[arg(long)]
        cache_key: Option<String>,

        /// Fail immediately when rate limited instead of awaiting cooldown.
        #[arg(long)]
        no_wait: bool,

        /// Disable classified retry.
        #[arg(long)]
        no_recovery: bool,
    },

    /// Run a set of test files through a runner, in scheduled order.
    Batch {
        /// Runner invoked once per file, e.g. `pytest`.
        #[arg(long)]
        runner: String,

        files: Vec<String>,

        /// Print the planned order without executing.
        #[arg(long)]
        show_order: bool,
    },

    /// Print cache and history statistics.
    Stats,
}
