//! Tidecast CLI - Command-line interface
//!
//! Serves the library, plays files and transfers on a network receiver.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use tidecast_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "tidecast")]
#[command(about = "Download, normalize and cast media to a network receiver")]
struct Cli {
    /// Console log level; RUST_LOG takes precedence when set
    #[arg(long, global = true, value_enum, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,

    /// Directory receiving the full trace log of this run
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())?;

    commands::handle_command(cli.command).await
}
