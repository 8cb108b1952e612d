//! Main entry point for the ziptool CLI application.

use clap::Parser;
use tracing::debug;

use ziptool::cli::{Cli, USAGE};
use ziptool::commands;
use ziptool::logging::init_logging;

/// Application entry point.
///
/// Operations run one at a time on a single thread. Failures are printed
/// to stdout and the process still exits successfully.
#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_logging();
    let cli = Cli::parse();

    let command = match cli.command() {
        Ok(Some(command)) => command,
        Ok(None) => {
            eprintln!("{}", USAGE);
            return;
        }
        Err(err) => {
            println!("{:#}", err);
            return;
        }
    };

    debug!(?command, "dispatching");
    if let Err(err) = commands::run(&command).await {
        println!("{:#}", err);
    }
}
