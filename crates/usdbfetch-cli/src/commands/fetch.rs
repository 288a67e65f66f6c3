use anyhow::{Context, Result};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use usdbfetch_core::{
    config::Config,
    pipeline::{Pipeline, PipelineStage},
};

pub async fn run(song_id: u32, config_path: Option<&Path>) -> Result<()> {
    let config = Config::load(config_path).context("Failed to load configuration")?;
    debug!("Effective config: {:?}", config);

    let (tx, mut rx) = mpsc::channel(64);

    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::with_template("{spinner:.cyan} [{elapsed_precise}] {msg}")?);
    pb.enable_steady_tick(Duration::from_millis(120));

    let progress_handle = tokio::spawn(async move {
        let mut video = Transfer::default();
        let mut audio = Transfer::default();

        while let Some(stage) = rx.recv().await {
            match stage {
                PipelineStage::Bootstrapping => pb.set_message("Preparing scratch directory..."),
                PipelineStage::DownloadingEncoder { received, total } => {
                    pb.set_message(format!("Download ffmpeg... {}", Transfer { received, total }));
                }
                PipelineStage::FetchingMetadata => pb.set_message("Fetching song info..."),
                PipelineStage::SongInfo { display_title } => {
                    pb.println(format!("\n{}\n", display_title));
                    pb.println("Start video download...");
                    pb.println("Start audio download...");
                }
                PipelineStage::DownloadingVideo { received, total } => {
                    video = Transfer { received, total };
                    pb.set_message(format!("video {} | audio {}", video, audio));
                }
                PipelineStage::DownloadingAudio { received, total } => {
                    audio = Transfer { received, total };
                    pb.set_message(format!("video {} | audio {}", video, audio));
                }
                PipelineStage::VideoDownloaded => pb.println("Finished video download"),
                PipelineStage::AudioDownloaded => pb.println("Finished audio download"),
                PipelineStage::Transcoding => pb.println("Start audio convert..."),
                PipelineStage::Transcoded => pb.println("Finished audio convert"),
                PipelineStage::FetchingContent => pb.println("Start song content download..."),
                PipelineStage::WaitingForSession { seconds } => {
                    pb.println(format!("Waiting {}s for the download session...", seconds));
                }
                PipelineStage::ContentFetched { filename } => {
                    pb.println(format!("Finished song content download ({})", filename));
                }
                PipelineStage::Assembling => pb.set_message("Assembling song folder..."),
                PipelineStage::Complete { output, duration } => {
                    pb.finish_with_message(format!(
                        "Done: {} ({:.1}s)",
                        output.display(),
                        duration.as_secs_f32()
                    ));
                }
                PipelineStage::Failed { stage, error } => {
                    pb.abandon_with_message(format!("Failed at {}: {}", stage, error));
                }
            }
        }
    });

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let scratch = config.paths.scratch.clone();
    let pipeline = Pipeline::new(config, tx).with_cancellation(cancel);
    let result = pipeline.run(song_id).await;

    // Closing the channel lets the progress task finish
    drop(pipeline);
    progress_handle.await?;

    match result {
        Ok(output) => {
            println!("\nOutput: {}", output.display());
            println!("Finished processing");
            Ok(())
        }
        Err(e) => {
            eprintln!("\nScratch files kept at: {}", scratch.display());
            Err(e).with_context(|| format!("Failed to fetch song {}", song_id))
        }
    }
}

#[derive(Default, Clone, Copy)]
struct Transfer {
    received: u64,
    total: Option<u64>,
}

impl std::fmt::Display for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.total {
            Some(total) => write!(f, "{} / {}", HumanBytes(self.received), HumanBytes(total)),
            None => write!(f, "{}", HumanBytes(self.received)),
        }
    }
}
