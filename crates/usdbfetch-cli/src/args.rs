use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "usdbfetch")]
#[command(author, version, about = "Fetch UltraStar song packages from USDB with video, audio and cover")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// USDB song id to fetch (shorthand for `fetch <SONG_ID>`)
    #[arg(value_name = "SONG_ID", value_parser = clap::value_parser!(u32).range(1..))]
    pub song_id: Option<u32>,

    /// Verbose output (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file path
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fetch one song package into the output directory
    Fetch {
        /// USDB song id
        #[arg(value_parser = clap::value_parser!(u32).range(1..))]
        song_id: u32,
    },

    /// Download the encoder if it is missing
    Setup,

    /// Check external tools
    Doctor,

    /// Show configuration
    Config,
}
