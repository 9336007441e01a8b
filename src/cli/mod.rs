use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

pub mod commands;

#[derive(Parser)]
#[command(name = "mission-relay")]
#[command(about = "File-based coordination for agents sharing a set of documents")]
#[command(long_about = "Mission Relay lets several agents edit one set of shared documents safely. \
                       Edits replace an anchor that must occur exactly once, locks are leases that \
                       expire, and every change is announced to subscribed consumers.")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Mission root directory (overrides mission.root)
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// Agent identity recorded as lock holder (defaults to host-pid)
    #[arg(long, global = true)]
    pub holder: Option<String>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the current content of a document
    Read {
        document: String,
    },
    /// Replace the single occurrence of SEARCH with REPLACE
    Apply {
        document: String,
        #[arg(long)]
        search: String,
        #[arg(long)]
        replace: String,
    },
    /// Insert TEXT right after the single occurrence of MARKER
    Insert {
        document: String,
        #[arg(long)]
        marker: String,
        #[arg(long)]
        text: String,
    },
    /// Add a line to the document's signals section
    Signal {
        document: String,
        /// Agent the line refers to
        #[arg(long)]
        agent: String,
        #[arg(long)]
        message: String,
        #[arg(long, value_enum, default_value = "to")]
        direction: Direction,
    },
    /// Create a document unless it already exists
    Create {
        document: String,
        /// Initial content
        #[arg(long, conflicts_with = "template_file")]
        template: Option<String>,
        /// Read initial content from a file
        #[arg(long)]
        template_file: Option<PathBuf>,
    },
    /// Show phase, usage and per-document sizes
    Status,
    /// Monitor the mission and print events as they happen
    Watch {
        /// Consumer name on the notification bus
        #[arg(long, default_value = "watch")]
        consumer: String,
        /// Stop after this many seconds (runs until interrupted otherwise)
        #[arg(long)]
        duration: Option<u64>,
    },
    /// Inspect or write configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Write the effective configuration to mission-relay.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    To,
    From,
}

impl From<Direction> for mission_relay::SignalDirection {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::To => mission_relay::SignalDirection::To,
            Direction::From => mission_relay::SignalDirection::From,
        }
    }
}
