//! Chainnet command line entry point.

mod cli;
mod demo;
mod logging;

use chainnet_primitives::KeyPair;
use clap::Parser;
use color_eyre::eyre;

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    logging::init_logging(&cli.logs)?;

    match cli.command {
        Commands::Demo(args) => demo::run(args).await,
        Commands::Keygen => {
            let key_pair = KeyPair::generate();
            println!("secret_key = \"{}\"", hex::encode(key_pair.secret_key()));
            println!("# public key {}", key_pair.public_key());
            Ok(())
        }
    }
}
