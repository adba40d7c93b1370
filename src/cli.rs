//! Command-line interface, built on clap.
//!
//! Defines the [`Cli`] struct with subcommands [`Command`] (run, mark,
//! roster, scans) and global flags (--config, --dry-run, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// rollcall reconciles daily attendance between a roster service and a
/// badge access log.
#[derive(Debug, Parser)]
#[command(name = "rollcall", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the configuration file (default: rollcall.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log intended writes instead of calling the roster service.
    #[arg(long, global = true, default_value_t = false)]
    pub dry_run: bool,

    /// Enable verbose output.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the scheduler daemon.
    Run {
        /// Also trigger the attendance mark once at startup.
        #[arg(long)]
        now: bool,
    },

    /// Evaluate the attendance window once and exit.
    Mark,

    /// Print today's eligible roster.
    Roster,

    /// Print the badge scans seen in today's attendance window.
    Scans,
}
