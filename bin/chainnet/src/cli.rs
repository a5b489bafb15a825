//! Command line definition.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Chainnet - topic based peer networking for replicated chains
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub(crate) struct Cli {
    /// Logging configuration (applies to all subcommands).
    #[command(flatten)]
    pub(crate) logs: LogArgs,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub(crate) command: Commands,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub(crate) enum Commands {
    /// Replicate a message across nodes sharing an in-memory DHT.
    Demo(DemoArgs),
    /// Generate a key pair for the `secret_key` config field.
    Keygen,
}

#[derive(Debug, Clone, Args)]
pub(crate) struct LogArgs {
    /// Silence all log output except errors.
    #[arg(short, long, global = true)]
    pub(crate) quiet: bool,

    /// Increase log verbosity (-v debug, -vv trace, -vvv transport frames).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub(crate) verbosity: u8,

    /// Extra filter directives, e.g. `chainnet_networker=trace`.
    #[arg(long = "log.filter", value_name = "DIRECTIVE", global = true)]
    pub(crate) filter: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub(crate) struct DemoArgs {
    /// Number of nodes to start. The first one writes.
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u16).range(2..))]
    pub(crate) nodes: u16,

    /// Entry appended by the writer.
    #[arg(long, default_value = "hello from chainnet")]
    pub(crate) message: String,

    /// Networker config (TOML) for every node. A `secret_key` only applies to the writer.
    #[arg(long, value_name = "PATH", env = "CHAINNET_CONFIG")]
    pub(crate) config: Option<PathBuf>,

    /// Seconds to wait for every reader to receive the entry.
    #[arg(long, default_value_t = 10)]
    pub(crate) timeout: u64,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_demo_args() {
        let cli = Cli::try_parse_from([
            "chainnet", "-vv", "demo", "--nodes", "4", "--message", "hi",
        ])
        .unwrap();
        assert_eq!(cli.logs.verbosity, 2);
        let Commands::Demo(args) = cli.command else {
            panic!("expected demo");
        };
        assert_eq!(args.nodes, 4);
        assert_eq!(args.message, "hi");
        assert!(args.config.is_none());
    }

    #[test]
    fn test_demo_needs_two_nodes() {
        assert!(Cli::try_parse_from(["chainnet", "demo", "--nodes", "1"]).is_err());
    }
}
