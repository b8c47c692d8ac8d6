//! imgxfer CLI - Virtual-disk image transfer client
//!
//! Moves disk images to and from a storage backend through the data-plane
//! proxy, with the transfer coordinated by the control-plane REST API.
//!
//! ## Quick Start
//!
//! ```bash
//! # Upload a local image into an existing disk
//! IMGXFER_TOKEN=... imgxfer upload ./disk.raw --disk 3f7c9a12
//!
//! # Download a snapshot, pausing halfway for a minute
//! imgxfer download ./snap.qcow2 --disk 8e21 --snapshot --pause-at 0.5 --settle 1m
//! ```

#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::cast_precision_loss)]

use anyhow::Result;
use clap::Parser;

mod commands;
pub mod ui;

use commands::{Cli, Command};
use imgxfer_core::session::Direction;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.global.verbose, cli.global.quiet);

    match cli.command {
        Command::Upload(args) => {
            commands::transfer::run(args, Direction::Upload, &cli.global).await
        }
        Command::Download(args) => {
            commands::transfer::run(args, Direction::Download, &cli.global).await
        }
        Command::Checksum(args) => commands::checksum::run(args, &cli.global).await,
        Command::Config(args) => commands::config::run(args),
        Command::Completions(args) => {
            commands::completions::run(args.shell);
            Ok(())
        }
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default = if verbose {
        "info,imgxfer=debug,imgxfer_core=debug"
    } else if quiet {
        "error"
    } else {
        "warn,imgxfer=info,imgxfer_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time().with_writer(std::io::stderr))
        .with(filter)
        .init();
}
