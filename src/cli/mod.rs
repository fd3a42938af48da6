//! CLI module for docflux
//!
//! Provides command-line interface for:
//! - serve: Run the live-query server
//! - check-config: Validate a configuration file

mod args;
mod commands;
mod errors;

pub use args::{Cli, Command};
pub use commands::{build_server, check_config, init_logging, run_command, serve};
pub use errors::{CliError, CliErrorCode, CliResult};

/// Parse arguments and run the selected command
pub async fn run() -> CliResult<()> {
    let cli = Cli::parse_args();
    run_command(cli.command).await
}
