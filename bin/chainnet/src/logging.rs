//! Logging setup for the chainnet binary.
//!
//! Without `RUST_LOG`, only chainnet's own crates log at the level picked by `-v`.
//! Everything else stays at `warn`. Frame-level transport traces need `-vvv`.

use eyre::Result;
use tracing_subscriber::EnvFilter;

use crate::cli::LogArgs;

/// Crates whose events follow the verbosity flags.
const CHAINNET_TARGETS: &[&str] = &[
    "chainnet",
    "chainnet_networker",
    "chainnet_net_discovery",
    "chainnet_primitives",
    "chainnet_test_utils",
];

const TRANSPORT_TARGET: &str = "chainnet_net_transport";

/// Initialize logging based on command line arguments.
///
/// `--quiet` shows only errors. Otherwise `RUST_LOG` replaces the chainnet defaults,
/// and `--log.filter` directives are added on top of either.
pub(crate) fn init_logging(args: &LogArgs) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(filter(args))
        .with_target(args.verbosity > 0)
        .without_time()
        .try_init()
        .map_err(|e| eyre::eyre!(e))?;
    Ok(())
}

fn filter(args: &LogArgs) -> EnvFilter {
    if args.quiet {
        return EnvFilter::new("error");
    }

    let mut filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(args.verbosity)));
    if let Some(custom) = &args.filter {
        for directive in custom.split(',').filter(|d| !d.is_empty()) {
            match directive.parse() {
                Ok(d) => filter = filter.add_directive(d),
                Err(err) => eprintln!("ignoring log directive {directive:?}: {err}"),
            }
        }
    }
    filter
}

fn default_directives(verbosity: u8) -> String {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let transport = match verbosity {
        0 => "info",
        1 | 2 => "debug",
        _ => "trace",
    };

    let mut directives = vec!["warn".to_owned()];
    directives.extend(CHAINNET_TARGETS.iter().map(|target| format!("{target}={level}")));
    directives.push(format!("{TRANSPORT_TARGET}={transport}"));
    directives.join(",")
}
