//! CLI command definitions for the `gribblesv` binary.
//!
//! Uses clap derive macros for argument parsing. Storage settings come from
//! the config file and can be overridden per flag or `GRIBBLE_*` variable.

pub mod migrate;
pub mod runner;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use gribble_types::config::{Backend, GribbleConfig};

/// Gribble job coordination storage tool.
#[derive(Parser)]
#[command(name = "gribblesv", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, env = "GRIBBLE_CONFIG", default_value = "gribble.toml")]
    pub config: PathBuf,

    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Detailed output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(flatten)]
    pub storage: StorageOverrides,

    #[command(subcommand)]
    pub command: Commands,
}

/// Per-field overrides for the `[storage]` config section.
#[derive(Args)]
pub struct StorageOverrides {
    /// Database backend (`sqlite` or `sqlite-memory`).
    #[arg(long, global = true, env = "GRIBBLE_BACKEND")]
    pub backend: Option<Backend>,

    /// Path of the SQLite database file.
    #[arg(long, global = true, env = "GRIBBLE_SQLITE_FILE")]
    pub sqlite_file: Option<String>,

    /// Maximum number of pooled connections.
    #[arg(long, global = true, env = "GRIBBLE_SQLITE_POOL_SIZE")]
    pub pool_size: Option<u32>,
}

impl StorageOverrides {
    /// Apply every override that was supplied on top of `config`.
    pub fn apply(&self, config: &mut GribbleConfig) {
        if let Some(backend) = self.backend {
            config.storage.backend = backend;
        }
        if let Some(file) = &self.sqlite_file {
            config.storage.sqlite_file = file.clone();
        }
        if let Some(size) = self.pool_size {
            config.storage.pool_size = size;
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Apply pending schema patches and print recorded versions.
    Migrate,

    /// Manage runners.
    Runner {
        #[command(subcommand)]
        action: RunnerCommand,
    },
}

#[derive(Subcommand)]
pub enum RunnerCommand {
    /// Register a new runner.
    Create {
        /// Authentication token for the runner.
        #[arg(long)]
        token: String,

        /// Human-readable description.
        #[arg(long, default_value = "")]
        description: String,

        /// Comma-separated tags (e.g. "docker,linux").
        #[arg(long, default_value = "")]
        tags: String,

        /// Accept jobs that carry no tags.
        #[arg(long)]
        run_untagged: bool,

        /// Lock the runner to its current projects.
        #[arg(long)]
        locked: bool,

        /// Mark the runner active.
        #[arg(long)]
        active: bool,

        /// Maximum job duration in seconds.
        #[arg(long)]
        max_timeout: Option<u64>,
    },

    /// Show a runner and its tags.
    Show {
        /// Runner token.
        token: String,

        /// Include retired runners.
        #[arg(long)]
        deleted: bool,
    },

    /// Replace a runner's tags. No tags removes all of them.
    Tag {
        /// Runner token.
        token: String,

        /// New tag set.
        tags: Vec<String>,
    },

    /// Set a runner's updated time to now.
    Touch {
        /// Runner token.
        token: String,
    },

    /// Retire (logically delete) a runner.
    Retire {
        /// Runner token.
        token: String,
    },
}
