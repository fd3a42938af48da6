//! CLI argument definitions using clap
//!
//! Commands:
//! - docflux serve --config <path>
//! - docflux check-config --config <path>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// docflux - document query and live-query engine
#[derive(Parser, Debug)]
#[command(name = "docflux")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the live-query server
    Serve {
        /// Path to configuration file
        #[arg(long, default_value = "./docflux.json")]
        config: PathBuf,
    },

    /// Validate a configuration file and print the resolved values
    CheckConfig {
        /// Path to configuration file
        #[arg(long, default_value = "./docflux.json")]
        config: PathBuf,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serve_with_default_config() {
        let cli = Cli::try_parse_from(["docflux", "serve"]).unwrap();
        match cli.command {
            Command::Serve { config } => assert_eq!(config, PathBuf::from("./docflux.json")),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_check_config() {
        let cli =
            Cli::try_parse_from(["docflux", "check-config", "--config", "/etc/docflux.json"])
                .unwrap();
        assert!(matches!(cli.command, Command::CheckConfig { .. }));
    }
}
