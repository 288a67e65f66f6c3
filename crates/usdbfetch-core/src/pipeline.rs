//! Pipeline orchestration for one song package

use crate::assembler::{fetch_cover, Assembler, SongParts};
use crate::bootstrap::{EncoderBootstrap, Scratch};
use crate::config::Config;
use crate::content::ContentFetcher;
use crate::downloader::{normalize_video_id, Downloader};
use crate::encoder::Encoder;
use crate::error::{ConfigError, DownloadError, UsdbError};
use crate::http::{build_client, build_session_client};
use crate::metadata::MetadataFetcher;

use reqwest::cookie::Jar;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Pipeline progress stages
#[derive(Debug, Clone)]
pub enum PipelineStage {
    Bootstrapping,
    DownloadingEncoder { received: u64, total: Option<u64> },
    FetchingMetadata,
    SongInfo { display_title: String },
    DownloadingVideo { received: u64, total: Option<u64> },
    VideoDownloaded,
    DownloadingAudio { received: u64, total: Option<u64> },
    AudioDownloaded,
    Transcoding,
    Transcoded,
    FetchingContent,
    WaitingForSession { seconds: u64 },
    ContentFetched { filename: String },
    Assembling,
    Complete { output: PathBuf, duration: Duration },
    Failed { stage: String, error: String },
}

/// Runs bootstrap, fetch, download, transcode and assembly for a song.
pub struct Pipeline {
    config: Config,
    progress_tx: mpsc::Sender<PipelineStage>,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(config: Config, progress_tx: mpsc::Sender<PipelineStage>) -> Self {
        Self {
            config,
            progress_tx,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop the run when `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Prepare the scratch directory and install the encoder, nothing else
    pub async fn setup(&self) -> Result<PathBuf, UsdbError> {
        let scratch = Scratch::new(&self.config.paths.scratch);
        scratch.prepare().await?;

        let client = self.client()?;
        let encoder = self.ensure_encoder(&client, &scratch).await?;

        scratch.remove().await?;
        Ok(encoder)
    }

    pub async fn run(&self, song_id: u32) -> Result<PathBuf, UsdbError> {
        self.run_inner(song_id).await.map_err(|e| {
            let _ = self.progress_tx.try_send(PipelineStage::Failed {
                stage: failed_stage(&e).to_string(),
                error: e.to_string(),
            });
            e
        })
    }

    async fn run_inner(&self, song_id: u32) -> Result<PathBuf, UsdbError> {
        let start_time = Instant::now();
        let config = &self.config;
        info!("Starting pipeline for song {}", song_id);

        // 1. Bootstrap
        self.emit(PipelineStage::Bootstrapping).await;
        let scratch = Scratch::new(&config.paths.scratch);
        scratch.prepare().await?;
        debug!("Scratch directory: {}", scratch.path().display());

        let client = self.client()?;
        let encoder_path = self.ensure_encoder(&client, &scratch).await?;
        let yt_dlp_path = config
            .yt_dlp_path()
            .map_err(|_| DownloadError::YtDlpNotFound)?;

        // 2. Metadata
        self.emit(PipelineStage::FetchingMetadata).await;
        let metadata_fetcher = MetadataFetcher::new(
            client.clone(),
            &config.usdb.api_base,
            config.request_timeout(),
        );
        let metadata = self
            .guarded(
                "metadata request",
                config.request_timeout(),
                metadata_fetcher.fetch(song_id),
            )
            .await?;
        self.emit(PipelineStage::SongInfo {
            display_title: metadata.display_title.clone(),
        })
        .await;

        let video_id = normalize_video_id(&metadata.youtube_id)?;

        // 3. Video leg, audio leg and content leg run side by side
        let downloader = Downloader::new(
            client.clone(),
            yt_dlp_path,
            scratch.path().to_path_buf(),
            &config.youtube.watch_prefix,
        );
        let encoder = Encoder::new(encoder_path);
        let jar = Arc::new(Jar::default());
        let session_client = build_session_client(config, jar.clone())
            .map_err(|e| ConfigError::InvalidValue(format!("HTTP client: {}", e)))?;
        let content_fetcher = ContentFetcher::new(
            session_client,
            jar,
            &config.usdb.site_base,
            config.handshake_delay(),
            config.request_timeout(),
        );

        let video_tx = self.progress_tx.clone();
        let on_video = move |received: u64, total: Option<u64>| {
            let _ = video_tx.try_send(PipelineStage::DownloadingVideo { received, total });
        };
        let audio_tx = self.progress_tx.clone();
        let on_audio = move |received: u64, total: Option<u64>| {
            let _ = audio_tx.try_send(PipelineStage::DownloadingAudio { received, total });
        };

        let video_leg = async {
            let asset = self
                .guarded(
                    "video download",
                    config.transfer_timeout(),
                    downloader.download_best_video(&video_id, on_video),
                )
                .await?;
            self.emit(PipelineStage::VideoDownloaded).await;
            Ok::<_, UsdbError>(asset)
        };

        let audio_leg = async {
            let raw = self
                .guarded(
                    "audio download",
                    config.transfer_timeout(),
                    downloader.download_best_audio(&video_id, on_audio),
                )
                .await?;
            self.emit(PipelineStage::AudioDownloaded).await;

            self.emit(PipelineStage::Transcoding).await;
            let mp3 = self
                .guarded("audio convert", config.process_timeout(), encoder.transcode(raw))
                .await?;
            self.emit(PipelineStage::Transcoded).await;
            Ok::<_, UsdbError>(mp3)
        };

        let content_leg = async {
            self.emit(PipelineStage::FetchingContent).await;
            let session = self
                .guarded(
                    "session request",
                    config.request_timeout(),
                    content_fetcher.open_session(),
                )
                .await?;

            let delay = content_fetcher.handshake_delay();
            self.emit(PipelineStage::WaitingForSession {
                seconds: delay.as_secs(),
            })
            .await;
            self.wait(delay).await?;

            let content = self
                .guarded(
                    "content request",
                    config.request_timeout(),
                    content_fetcher.download(song_id, &session),
                )
                .await?;
            self.emit(PipelineStage::ContentFetched {
                filename: content.server_filename.clone(),
            })
            .await;
            Ok::<_, UsdbError>(content)
        };

        let (video, audio, content) = tokio::try_join!(video_leg, audio_leg, content_leg)?;

        // 4. Cover and assembly
        let cover = if metadata.cover_url.is_empty() {
            debug!("Song {} has no cover link", song_id);
            None
        } else {
            Some(
                self.guarded(
                    "cover request",
                    config.request_timeout(),
                    fetch_cover(&client, &metadata.cover_url, config.request_timeout()),
                )
                .await?,
            )
        };

        self.emit(PipelineStage::Assembling).await;
        let assembler = Assembler::new(scratch.path().to_path_buf(), config.paths.output.clone());
        let output = assembler
            .assemble(
                song_id,
                SongParts {
                    metadata,
                    content,
                    cover,
                    video,
                    audio,
                },
            )
            .await?;

        // Only a successful run clears the scratch directory
        scratch.remove().await?;

        let duration = start_time.elapsed();
        info!(
            "Pipeline complete: {} ({:.1}s)",
            output.display(),
            duration.as_secs_f32()
        );
        self.emit(PipelineStage::Complete {
            output: output.clone(),
            duration,
        })
        .await;

        Ok(output)
    }

    fn client(&self) -> Result<reqwest::Client, UsdbError> {
        build_client(&self.config)
            .map_err(|e| ConfigError::InvalidValue(format!("HTTP client: {}", e)).into())
    }

    async fn ensure_encoder(
        &self,
        client: &reqwest::Client,
        scratch: &Scratch,
    ) -> Result<PathBuf, UsdbError> {
        let tx = self.progress_tx.clone();
        let bootstrap = EncoderBootstrap::new(
            client.clone(),
            &self.config.encoder.archive_url,
            self.config.paths.encoder.clone(),
            scratch.path().to_path_buf(),
        );
        self.guarded(
            "encoder download",
            self.config.transfer_timeout(),
            bootstrap.ensure_available(move |received, total| {
                let _ = tx.try_send(PipelineStage::DownloadingEncoder { received, total });
            }),
        )
        .await
    }

    async fn emit(&self, stage: PipelineStage) {
        let _ = self.progress_tx.send(stage).await;
    }

    /// Flat handshake wait; only cancellation cuts it short
    async fn wait(&self, delay: Duration) -> Result<(), UsdbError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(UsdbError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Bound `fut` by `limit` and abort it on cancellation
    async fn guarded<T, E>(
        &self,
        operation: &'static str,
        limit: Duration,
        fut: impl Future<Output = Result<T, E>>,
    ) -> Result<T, UsdbError>
    where
        UsdbError: From<E>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(UsdbError::Cancelled),
            res = tokio::time::timeout(limit, fut) => match res {
                Ok(inner) => inner.map_err(UsdbError::from),
                Err(_) => Err(UsdbError::Timeout {
                    operation,
                    seconds: limit.as_secs(),
                }),
            },
        }
    }
}

fn failed_stage(err: &UsdbError) -> &'static str {
    match err {
        UsdbError::Metadata(_) => "metadata",
        UsdbError::Content(_) => "content",
        UsdbError::Download(_) => "download",
        UsdbError::Transcode(_) => "transcode",
        UsdbError::Bootstrap(_) => "bootstrap",
        UsdbError::Assemble(_) => "assemble",
        UsdbError::Config(_) => "config",
        UsdbError::Timeout { operation, .. } => *operation,
        UsdbError::Cancelled => "cancelled",
        UsdbError::Io(_) => "filesystem",
    }
}
