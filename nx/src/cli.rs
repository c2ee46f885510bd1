//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// nxcd - pull-based NixOS deployer
#[derive(Parser)]
#[command(
    name = "nxcd",
    about = "Watch a git branch and rebuild this NixOS host when it moves",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute (defaults to `run`)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Poll the repository and rebuild on every new commit
    Run,

    /// Print the current remote head hash and exit
    Head {
        /// Repository as owner/name (defaults to the configured one)
        repo: Option<String>,

        /// Branch to report
        #[arg(short, long)]
        branch: Option<String>,
    },

    /// Validate the configuration and print the resolved settings
    Check,
}
