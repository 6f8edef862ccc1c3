//! Skiff - agentless, push-based configuration management.
//!
//! The controller connects to each target over ssh (or a local
//! subprocess), bootstraps a small executor, and runs a deploy script
//! of idempotent operations against it.

#![deny(unsafe_code)]
#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod init;
mod render;
mod run;
mod script;

use clap::{ArgAction, Parser, Subcommand};

/// Runs a deploy script on an inventory of hosts.
#[derive(Parser)]
#[command(name = "skiff", version, about, long_about = None)]
#[command(subcommand_negates_reqs = true)]
struct Cli {
    /// Comma separated list of hosts to run on; all hosts when
    /// omitted. Duplicates are ignored, unknown hosts are fatal.
    #[arg(short = 'H', long = "hosts")]
    hosts: Option<String>,

    /// Print what would be done instead of performing any actions.
    /// Probing commands still run to determine current state.
    #[arg(long, visible_aliases = ["dry-run", "pretend"])]
    dry: bool,

    /// Increase output verbosity. Can be given multiple times.
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Don't display a change summary for each operation.
    #[arg(long = "no-changes")]
    no_changes: bool,

    /// Display a content diff when an operation changes a file. Use
    /// with care, this may print secrets.
    #[arg(long)]
    diff: bool,

    /// Enable debugging output; implies maximum verbosity and raw
    /// error chains instead of the script stack.
    #[arg(long)]
    debug: bool,

    /// Disable colored output. Also set via the NO_COLOR environment
    /// variable.
    #[arg(long = "no-color")]
    no_color: bool,

    /// The inventories to run on: inventory files (*.toml) or
    /// single-host urls (ssh://user@host, user@host, local:).
    #[arg(required = true)]
    inventory: Vec<String>,

    /// The deploy script to run on every selected host.
    #[arg(required = true)]
    script: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter deploy structure into the current directory.
    Init {
        /// The structure to create.
        #[arg(value_enum, default_value_t = init::Layout::Minimal)]
        layout: init::Layout,
    },
}

fn main() {
    // A usage error is a single line on stderr and exit code 1.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.use_stderr() => {
            eprintln!("{e}");
            std::process::exit(1);
        }
        // --help / --version
        Err(e) => e.exit(),
    };

    if cli.no_color || std::env::var_os("NO_COLOR").is_some_and(|v| !v.is_empty()) {
        colored::control::set_override(false);
    }

    let filter = if cli.debug {
        "trace"
    } else {
        match cli.verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = match &cli.command {
        Some(Commands::Init { layout }) => init::scaffold(*layout),
        None => run::main_run(&cli),
    };

    if let Err(e) = result {
        render::print_error(&e, cli.debug);
        std::process::exit(1);
    }
}
