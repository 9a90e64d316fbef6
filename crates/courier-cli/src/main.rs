//! Courier command-line entry point.
//!
//! Binary name: `courier`
//!
//! Parses CLI arguments, sets up tracing, then dispatches to the command
//! handler.

mod cli;

use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands};
use courier_observe::tracing_setup::{init_tracing, shutdown_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over the verbosity flags
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,courier_core=debug",
        _ => "trace",
    };
    if let Err(e) = init_tracing(cli.otel, filter) {
        eprintln!("warning: tracing not initialized: {e}");
    }

    let result = match cli.command {
        Commands::Bench(args) => cli::bench::bench(args, cli.json, cli.quiet).await,
        Commands::Trace { encoded, normalize } => cli::trace::trace(&encoded, normalize, cli.json),
        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(shell, &mut cmd, "courier", &mut std::io::stdout());
            Ok(())
        }
    };

    shutdown_tracing();
    result
}
