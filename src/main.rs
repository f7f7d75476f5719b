mod cli;
mod config;
mod console;
mod error;
mod image_stream;
mod logger;
mod protocol;
mod session;
mod transport;

use anyhow::{Context, Result};
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    logger::initialize(cli.log_level, cli.log_file.as_deref())
        .context("Failed to set up logging")?;

    match cli.command {
        command @ Commands::Connect { .. } => {
            let options = command.into_connect_options();
            console::run(options)
                .await
                .context("Camera session failed")?;
        }
    }

    Ok(())
}
