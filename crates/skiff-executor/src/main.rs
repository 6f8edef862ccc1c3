//! Entry point of the remote executor binary.

#![deny(unsafe_code)]
#![deny(clippy::all)]

use clap::Parser;
use std::io::{stdin, stdout};

/// Services skiff tunnel packets on stdin/stdout.
#[derive(Parser)]
#[command(name = "skiff-executor", version, about, long_about = None)]
struct Cli {
    /// Log every handled packet to stderr.
    #[arg(long)]
    debug: bool,
}

fn main() {
    let cli = Cli::parse();

    // stdout carries the packet stream, so all logging goes to stderr.
    let filter = if cli.debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let code = skiff_executor::serve(&mut stdin().lock(), &mut stdout().lock());
    std::process::exit(code);
}
