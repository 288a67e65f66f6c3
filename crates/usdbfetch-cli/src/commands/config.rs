use anyhow::{Context, Result};
use std::path::Path;
use usdbfetch_core::config::Config;

pub async fn run(config_path: Option<&Path>) -> Result<()> {
    let config = Config::load(config_path)?;

    println!("usdbfetch configuration\n");
    let rendered = toml::to_string_pretty(&config).context("Failed to render configuration")?;
    println!("{}", rendered.trim_end());

    if config.paths.yt_dlp.is_none() {
        match config.yt_dlp_path() {
            Ok(path) => println!("\n# yt_dlp auto-detected at {}", path.display()),
            Err(_) => println!("\n# yt_dlp not set and not found in PATH"),
        }
    }

    println!("\nConfig sources (later entries win):");
    println!("  1. Built-in defaults");
    if let Some(path) = Config::default_file() {
        println!("  2. {}", path.display());
    }
    if let Some(p) = config_path {
        println!("  3. {} (specified)", p.display());
    }
    println!("  4. Environment variables (USDBFETCH_<SECTION>__<KEY>)");

    Ok(())
}
