//! Agentry - multi-agent coordination over a durable file mailbox.

use clap::Parser;
use std::process::ExitCode;

mod cli;
mod config;
mod core;
mod error;
mod invoker;
mod logging;
mod orchestrator;

use cli::Commands;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = logging::init() {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    let args = Commands::parse();

    match args.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
