//! QueueKing - Telegram bot for fair waiting lines.

use clap::Parser;
use std::process::ExitCode;

use queueking::{logging, Commands};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Commands::parse();

    // Keep the guard alive so the file writer flushes on exit
    let _log_guard = match logging::init() {
        Ok((guard, _)) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match args.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
