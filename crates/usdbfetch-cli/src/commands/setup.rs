use anyhow::{Context, Result};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use std::path::Path;
use tokio::sync::mpsc;

use usdbfetch_core::{
    config::Config,
    pipeline::{Pipeline, PipelineStage},
};

pub async fn run(config_path: Option<&Path>) -> Result<()> {
    let config = Config::load(config_path).context("Failed to load configuration")?;

    if config.paths.encoder.exists() {
        println!("Encoder already present at {}", config.paths.encoder.display());
        return Ok(());
    }

    println!("Download ffmpeg from {}", config.encoder.archive_url);

    let (tx, mut rx) = mpsc::channel(64);
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {bytes}/{total_bytes} {msg}")?
            .progress_chars("=>-"),
    );

    let progress_handle = tokio::spawn(async move {
        while let Some(stage) = rx.recv().await {
            if let PipelineStage::DownloadingEncoder { received, total } = stage {
                if let Some(total) = total {
                    pb.set_length(total);
                }
                pb.set_position(received);
            }
        }
        pb.finish_and_clear();
    });

    let pipeline = Pipeline::new(config, tx);
    let result = pipeline.setup().await;
    drop(pipeline);
    progress_handle.await?;

    let encoder = result.context("Failed to install the encoder")?;
    let size = std::fs::metadata(&encoder).map(|m| m.len()).unwrap_or(0);
    println!("Finished downloading ffmpeg: {} ({})", encoder.display(), HumanBytes(size));
    Ok(())
}
