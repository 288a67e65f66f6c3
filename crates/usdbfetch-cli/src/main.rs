mod args;
mod commands;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use args::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Phase lines come from the progress display; logs stay quiet unless asked
    let filter = match cli.verbose {
        0 => "usdbfetch=warn,usdbfetch_core=warn",
        1 => "usdbfetch=info,usdbfetch_core=info",
        2 => "usdbfetch=debug,usdbfetch_core=debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match cli.command {
        Some(Commands::Fetch { song_id }) => {
            commands::fetch::run(song_id, cli.config.as_deref()).await
        }
        Some(Commands::Setup) => commands::setup::run(cli.config.as_deref()).await,
        Some(Commands::Doctor) => commands::doctor::run(cli.config.as_deref()).await,
        Some(Commands::Config) => commands::config::run(cli.config.as_deref()).await,
        None => {
            if let Some(song_id) = cli.song_id {
                commands::fetch::run(song_id, cli.config.as_deref()).await
            } else {
                use clap::CommandFactory;
                Cli::command().print_help()?;
                println!();
                Ok(())
            }
        }
    }
}
