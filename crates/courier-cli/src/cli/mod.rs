//! CLI command definitions for the `courier` binary.

pub mod bench;
pub mod trace;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;

/// Exercise and inspect a Courier message bus.
#[derive(Parser)]
#[command(name = "courier", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Push messages between two in-process buses and report throughput.
    Bench(BenchArgs),

    /// Decode an encoded trace and print it as a tree.
    Trace {
        /// Trace in its bracketed string form.
        encoded: String,

        /// Compact and sort the tree before printing.
        #[arg(long)]
        normalize: bool,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[derive(Args, Debug, Clone)]
pub struct BenchArgs {
    /// Number of messages to send.
    #[arg(short = 'n', long, default_value_t = 10_000)]
    pub messages: u64,

    /// Bus configuration file (limits, throttle policy, retry, routing).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Spread messages over this many sequence ids.
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub sequenced: Option<u64>,

    /// Route or routing-table route name to send along.
    #[arg(long, default_value = "server/inbox")]
    pub route: String,
}
