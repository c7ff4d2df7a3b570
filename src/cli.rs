//! Command-line interface, parsed with clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Root command for the fleetform binary.
#[derive(Parser)]
#[command(
    author,
    version,
    about = "Fleetform - barrier-synchronized desired-state deployment"
)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Commands,

    /// Worker thread bound (defaults to the number of CPUs)
    #[clap(long, short, global = true, env = "FLEETFORM_WORKERS")]
    pub(crate) workers: Option<usize>,

    /// Let hosts progress independently instead of in lockstep
    #[clap(long, global = true, env = "FLEETFORM_NO_SYNC")]
    pub(crate) no_sync: bool,

    /// Keep the fleet running after a host fails
    #[clap(long, global = true, env = "FLEETFORM_NO_FAIL_EARLY")]
    pub(crate) no_fail_early: bool,

    /// Directory resolving `assets` / `template_assets` keys
    #[clap(long, global = true, env = "FLEETFORM_ASSETS")]
    pub(crate) assets: Option<PathBuf>,

    /// Prompt for a sudo password used by hosts without their own
    #[clap(long, global = true)]
    pub(crate) ask_sudo_pass: bool,

    /// Skip the log file, log to the terminal only
    #[clap(long, global = true, env = "FLEETFORM_NO_LOG_FILE")]
    pub(crate) no_log_file: bool,

    /// Verbosity level (-v = debug, -vv = trace)
    #[clap(short, long, action = clap::ArgAction::Count, global = true)]
    pub(crate) verbosity: u8,
}

/// Available subcommands.
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Bring the fleet into the configuration's desired state
    Apply {
        /// Configuration manifest (TOML)
        #[clap(long, short)]
        config: PathBuf,

        /// Fleet manifest; omit to target localhost
        #[clap(long, short)]
        fleet: Option<PathBuf>,
    },

    /// Remove the configuration's state from the fleet
    Delete {
        /// Configuration manifest (TOML)
        #[clap(long, short)]
        config: PathBuf,

        /// Fleet manifest; omit to target localhost
        #[clap(long, short)]
        fleet: Option<PathBuf>,
    },

    /// Check whether the fleet satisfies the configuration
    Check {
        /// Configuration manifest (TOML)
        #[clap(long, short)]
        config: PathBuf,

        /// Fleet manifest; omit to target localhost
        #[clap(long, short)]
        fleet: Option<PathBuf>,
    },

    /// Internal askpass hook for the sudo helper
    #[command(hide = true)]
    Askpass {
        /// FIFO to read the password from
        fifo: PathBuf,

        /// Seconds to wait for the password
        timeout: f64,
    },
}

/// Parses the command line, capping verbosity at the trace level.
pub(crate) fn get_cli() -> Cli {
    let mut cli = Cli::parse();
    cli.verbosity = cli.verbosity.min(2);
    cli
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_askpass_parses_positionals() {
        let cli = Cli::parse_from(["fleetform", "askpass", "/tmp/pipe", "5"]);
        match cli.command {
            Commands::Askpass { fifo, timeout } => {
                assert_eq!(fifo, PathBuf::from("/tmp/pipe"));
                assert_eq!(timeout, 5.0);
            }
            _ => panic!("expected askpass subcommand"),
        }
    }
}
