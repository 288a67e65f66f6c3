//! YouTube stream selection and transfer.
//!
//! yt-dlp is only asked for the format list; the chosen stream is fetched
//! directly so the transfer can be streamed to disk with progress.

use crate::error::DownloadError;
use futures::StreamExt;
use regex::Regex;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// A media file sitting in the scratch directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedAsset {
    pub path: PathBuf,
    /// Without the leading dot
    pub extension: String,
}

/// One entry of the platform's format list.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamVariant {
    pub format_id: String,
    pub ext: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub abr: Option<f64>,
    #[serde(default)]
    pub filesize: Option<u64>,
    #[serde(default)]
    pub http_headers: HashMap<String, String>,
    #[serde(default)]
    pub downloader_options: Option<DownloaderOptions>,
}

/// Transfer hints yt-dlp attaches to a format.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DownloaderOptions {
    /// Fetch the payload in ranged requests of this many bytes
    #[serde(default)]
    pub http_chunk_size: Option<u64>,
}

impl StreamVariant {
    pub fn has_video(&self) -> bool {
        codec_present(self.vcodec.as_deref())
    }

    pub fn has_audio(&self) -> bool {
        codec_present(self.acodec.as_deref())
    }

    /// Plain HTTP(S) payload, as opposed to HLS/DASH manifests
    pub fn is_direct(&self) -> bool {
        self.url.is_some() && matches!(self.protocol.as_deref(), Some("https") | Some("http"))
    }

    pub fn chunk_size(&self) -> Option<u64> {
        self.downloader_options
            .as_ref()
            .and_then(|o| o.http_chunk_size)
            .filter(|&size| size > 0)
    }
}

fn codec_present(codec: Option<&str>) -> bool {
    matches!(codec, Some(c) if !c.is_empty() && c != "none")
}

#[derive(Debug, Deserialize)]
struct FormatList {
    #[serde(default)]
    formats: Vec<StreamVariant>,
}

/// Highest resolution stream carrying video
pub fn best_video(variants: &[StreamVariant]) -> Option<&StreamVariant> {
    first_max(
        variants.iter().filter(|v| v.has_video() && v.is_direct()),
        |v| v.height.unwrap_or(0),
    )
}

/// Highest bitrate stream carrying audio
pub fn best_audio(variants: &[StreamVariant]) -> Option<&StreamVariant> {
    first_max(
        variants.iter().filter(|v| v.has_audio() && v.is_direct()),
        |v| v.abr.unwrap_or(0.0),
    )
}

// Iterator::max_by_key keeps the last maximum; ties must keep list order.
fn first_max<'a, T, K, F>(items: impl Iterator<Item = &'a T>, key: F) -> Option<&'a T>
where
    K: PartialOrd,
    F: Fn(&T) -> K,
{
    items.fold(None, |best, item| match best {
        Some(b) if key(item) <= key(b) => Some(b),
        _ => Some(item),
    })
}

/// Accept a bare video id or a watch/short link and return the id
pub fn normalize_video_id(raw: &str) -> Result<String, DownloadError> {
    let raw = raw.trim();
    let bare = Regex::new(r"^[A-Za-z0-9_-]{11}$").map_err(|_| invalid(raw))?;
    if bare.is_match(raw) {
        return Ok(raw.to_string());
    }

    let linked = Regex::new(r"(?:[?&]v=|youtu\.be/|/shorts/|/embed/)([A-Za-z0-9_-]{11})")
        .map_err(|_| invalid(raw))?;
    linked
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| invalid(raw))
}

fn invalid(raw: &str) -> DownloadError {
    DownloadError::InvalidVideoId(raw.to_string())
}

#[derive(Debug, Clone)]
pub struct Downloader {
    client: reqwest::Client,
    yt_dlp_path: PathBuf,
    scratch_dir: PathBuf,
    watch_prefix: String,
}

impl Downloader {
    pub fn new(
        client: reqwest::Client,
        yt_dlp_path: PathBuf,
        scratch_dir: PathBuf,
        watch_prefix: impl Into<String>,
    ) -> Self {
        Self {
            client,
            yt_dlp_path,
            scratch_dir,
            watch_prefix: watch_prefix.into(),
        }
    }

    /// Ask yt-dlp for every stream variant of a video
    pub async fn list_variants(&self, video_id: &str) -> Result<Vec<StreamVariant>, DownloadError> {
        let url = format!("{}{}", self.watch_prefix, video_id);
        debug!("Listing formats for {}", url);

        let output = Command::new(&self.yt_dlp_path)
            .args([
                "--dump-single-json",
                "--skip-download",
                "--no-playlist",
                "--no-warnings",
            ])
            .arg(&url)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => DownloadError::YtDlpNotFound,
                _ => DownloadError::Io(e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            debug!("yt-dlp stderr: {}", stderr);
            return Err(DownloadError::YtDlpFailed {
                code: output.status.code(),
                stderr,
            });
        }

        let list: FormatList = serde_json::from_slice(&output.stdout)?;
        debug!("{} formats available", list.formats.len());
        Ok(list.formats)
    }

    /// Download the highest resolution video stream
    pub async fn download_best_video(
        &self,
        video_id: &str,
        progress: impl Fn(u64, Option<u64>),
    ) -> Result<DownloadedAsset, DownloadError> {
        info!("Start video download");
        let variants = self.list_variants(video_id).await?;
        let variant = best_video(&variants).ok_or(DownloadError::NoVariants("video"))?;
        debug!("Video format {} ({}p, {})", variant.format_id, variant.height.unwrap_or(0), variant.ext);

        let dest = self.scratch_dir.join(format!("{}.video.tmp", video_id));
        self.download_variant(variant, &dest, progress).await?;

        info!("Finished video download");
        Ok(DownloadedAsset {
            path: dest,
            extension: variant.ext.clone(),
        })
    }

    /// Download the highest bitrate audio stream
    pub async fn download_best_audio(
        &self,
        video_id: &str,
        progress: impl Fn(u64, Option<u64>),
    ) -> Result<DownloadedAsset, DownloadError> {
        info!("Start audio download");
        let variants = self.list_variants(video_id).await?;
        let variant = best_audio(&variants).ok_or(DownloadError::NoVariants("audio"))?;
        debug!("Audio format {} ({:.1} kbps, {})", variant.format_id, variant.abr.unwrap_or(0.0), variant.ext);

        let dest = self.scratch_dir.join(format!("{}.audiovideo.tmp", video_id));
        self.download_variant(variant, &dest, progress).await?;

        info!("Finished audio download");
        Ok(DownloadedAsset {
            path: dest,
            extension: variant.ext.clone(),
        })
    }

    /// Stream one variant's payload into `dest`.
    ///
    /// Formats with a chunk size are fetched in ranged requests; the
    /// platform throttles single unranged requests for those.
    pub async fn download_variant(
        &self,
        variant: &StreamVariant,
        dest: &Path,
        progress: impl Fn(u64, Option<u64>),
    ) -> Result<(), DownloadError> {
        let url = variant
            .url
            .as_deref()
            .ok_or(DownloadError::NoVariants("direct"))?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut received: u64 = 0;

        match variant.chunk_size() {
            None => {
                let response = self.request(variant, url).send().await?;
                if !response.status().is_success() {
                    return Err(DownloadError::Status(response.status()));
                }
                let total = response.content_length().or(variant.filesize);
                write_body(response, &mut file, &mut received, total, &progress).await?;
            }
            Some(chunk_size) => {
                let mut total = variant.filesize;
                loop {
                    let end = received + chunk_size - 1;
                    debug!("Requesting bytes {}-{} of format {}", received, end, variant.format_id);
                    let response = self
                        .request(variant, url)
                        .header(RANGE, format!("bytes={}-{}", received, end))
                        .send()
                        .await?;

                    let status = response.status();
                    if status == StatusCode::RANGE_NOT_SATISFIABLE && received > 0 {
                        break;
                    }
                    if !status.is_success() {
                        return Err(DownloadError::Status(status));
                    }
                    if status != StatusCode::PARTIAL_CONTENT {
                        // Range ignored: this response is the whole payload
                        let total = response.content_length().or(total);
                        write_body(response, &mut file, &mut received, total, &progress).await?;
                        break;
                    }

                    total = content_range_total(&response).or(total);
                    let before = received;
                    write_body(response, &mut file, &mut received, total, &progress).await?;

                    let short = received - before < chunk_size;
                    let complete = total.is_some_and(|t| received >= t);
                    if short || complete {
                        break;
                    }
                }
            }
        }
        file.flush().await?;

        debug!("Wrote {} bytes to {}", received, dest.display());
        Ok(())
    }

    fn request(&self, variant: &StreamVariant, url: &str) -> reqwest::RequestBuilder {
        let mut request = self.client.get(url);
        for (name, value) in &variant.http_headers {
            request = request.header(name, value);
        }
        request
    }
}

async fn write_body(
    response: reqwest::Response,
    file: &mut tokio::fs::File,
    received: &mut u64,
    total: Option<u64>,
    progress: &impl Fn(u64, Option<u64>),
) -> Result<(), DownloadError> {
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        *received += chunk.len() as u64;
        progress(*received, total);
    }
    Ok(())
}

/// Full length from `Content-Range: bytes <from>-<to>/<total>`
fn content_range_total(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_RANGE)?
        .to_str()
        .ok()?
        .rsplit('/')
        .next()?
        .trim()
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn fixture() -> Vec<StreamVariant> {
        let list: FormatList =
            serde_json::from_str(include_str!("../tests/fixtures/formats.json")).unwrap();
        list.formats
    }

    #[test]
    fn test_best_video_prefers_first_of_highest_direct() {
        let variants = fixture();
        let best = best_video(&variants).unwrap();
        // 2160p is HLS only; 137 and 248 tie at 1080p and 137 is listed first
        assert_eq!(best.format_id, "137");
        assert_eq!(best.ext, "mp4");
    }

    #[test]
    fn test_best_audio_by_bitrate() {
        let variants = fixture();
        let best = best_audio(&variants).unwrap();
        assert_eq!(best.format_id, "251");
        assert_eq!(best.ext, "webm");
    }

    #[test]
    fn test_no_variants() {
        let variants: Vec<StreamVariant> = fixture()
            .into_iter()
            .filter(|v| v.protocol.as_deref() != Some("https"))
            .collect();
        assert!(best_video(&variants).is_none());
        assert!(best_audio(&variants).is_none());
    }

    #[test]
    fn test_normalize_video_id() {
        assert_eq!(normalize_video_id("fJ9rUzIMcZQ").unwrap(), "fJ9rUzIMcZQ");
        assert_eq!(
            normalize_video_id("https://www.youtube.com/watch?v=fJ9rUzIMcZQ&t=3").unwrap(),
            "fJ9rUzIMcZQ"
        );
        assert_eq!(normalize_video_id(" https://youtu.be/fJ9rUzIMcZQ ").unwrap(), "fJ9rUzIMcZQ");
        assert!(matches!(
            normalize_video_id(""),
            Err(DownloadError::InvalidVideoId(_))
        ));
        assert!(normalize_video_id("abc123").is_err());
    }

    #[tokio::test]
    async fn test_download_variant_streams_to_file() {
        let server = MockServer::start_async().await;
        let m = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/videoplayback")
                    .header("x-extra", "1");
                then.status(200).body(vec![7u8; 4096]);
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(
            reqwest::Client::new(),
            PathBuf::from("yt-dlp"),
            dir.path().to_path_buf(),
            "https://www.youtube.com/watch?v=",
        );
        let variant = StreamVariant {
            format_id: "137".to_string(),
            ext: "mp4".to_string(),
            url: Some(server.url("/videoplayback")),
            protocol: Some("http".to_string()),
            vcodec: Some("avc1".to_string()),
            acodec: None,
            height: Some(1080),
            abr: None,
            filesize: None,
            http_headers: HashMap::from([("x-extra".to_string(), "1".to_string())]),
            downloader_options: None,
        };

        let seen = std::cell::Cell::new(0u64);
        let dest = dir.path().join("out.tmp");
        downloader
            .download_variant(&variant, &dest, |received, _| seen.set(received))
            .await
            .unwrap();

        m.assert_async().await;
        assert_eq!(std::fs::read(&dest).unwrap().len(), 4096);
        assert_eq!(seen.get(), 4096);
    }

    #[test]
    fn test_chunk_size_from_format_json() {
        let variant: StreamVariant = serde_json::from_str(
            r#"{"format_id":"137","ext":"mp4","downloader_options":{"http_chunk_size":10485760}}"#,
        )
        .unwrap();
        assert_eq!(variant.chunk_size(), Some(10_485_760));

        let variant: StreamVariant =
            serde_json::from_str(r#"{"format_id":"18","ext":"mp4"}"#).unwrap();
        assert_eq!(variant.chunk_size(), None);
    }

    #[tokio::test]
    async fn test_download_variant_in_ranged_chunks() {
        let server = MockServer::start_async().await;
        let mut chunks = Vec::new();
        for (range, content_range, body) in [
            ("bytes=0-3", "bytes 0-3/10", "0123"),
            ("bytes=4-7", "bytes 4-7/10", "4567"),
            ("bytes=8-11", "bytes 8-9/10", "89"),
        ] {
            let m = server
                .mock_async(|when, then| {
                    when.method(GET).path("/videoplayback").header("range", range);
                    then.status(206)
                        .header("content-range", content_range)
                        .body(body);
                })
                .await;
            chunks.push(m);
        }

        let dir = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(
            reqwest::Client::new(),
            PathBuf::from("yt-dlp"),
            dir.path().to_path_buf(),
            "",
        );
        let mut variant = fixture().remove(2);
        variant.url = Some(server.url("/videoplayback"));
        variant.downloader_options = Some(DownloaderOptions {
            http_chunk_size: Some(4),
        });

        let seen = std::cell::Cell::new((0u64, None));
        let dest = dir.path().join("out.tmp");
        downloader
            .download_variant(&variant, &dest, |received, total| seen.set((received, total)))
            .await
            .unwrap();

        for m in &chunks {
            m.assert_async().await;
        }
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "0123456789");
        assert_eq!(seen.get(), (10, Some(10)));
    }

    #[tokio::test]
    async fn test_download_variant_http_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.path("/gone");
                then.status(403);
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(
            reqwest::Client::new(),
            PathBuf::from("yt-dlp"),
            dir.path().to_path_buf(),
            "",
        );
        let mut variant = fixture().remove(2);
        variant.url = Some(server.url("/gone"));

        let err = downloader
            .download_variant(&variant, &dir.path().join("x"), |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Status(s) if s.as_u16() == 403));
    }

    #[tokio::test]
    async fn test_missing_yt_dlp() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(
            reqwest::Client::new(),
            dir.path().join("no-such-yt-dlp"),
            dir.path().to_path_buf(),
            "",
        );
        let err = downloader.list_variants("fJ9rUzIMcZQ").await.unwrap_err();
        assert!(matches!(err, DownloadError::YtDlpNotFound));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_download_best_audio_with_stub_yt_dlp() {
        use std::os::unix::fs::PermissionsExt;

        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.path("/audio");
                then.status(200).body("opus-bytes");
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let listing = dir.path().join("formats.json");
        std::fs::write(
            &listing,
            format!(
                r#"{{"formats":[
                    {{"format_id":"140","ext":"m4a","protocol":"http","url":"{0}","vcodec":"none","acodec":"mp4a","abr":128.0}},
                    {{"format_id":"251","ext":"webm","protocol":"http","url":"{0}","vcodec":"none","acodec":"opus","abr":160.0}}
                ]}}"#,
                server.url("/audio")
            ),
        )
        .unwrap();

        let script = dir.path().join("yt-dlp");
        std::fs::write(&script, format!("#!/bin/sh\ncat '{}'\n", listing.display())).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let downloader =
            Downloader::new(reqwest::Client::new(), script, dir.path().to_path_buf(), "https://yt/");
        let asset = downloader
            .download_best_audio("fJ9rUzIMcZQ", |_, _| {})
            .await
            .unwrap();

        assert_eq!(asset.extension, "webm");
        assert_eq!(asset.path, dir.path().join("fJ9rUzIMcZQ.audiovideo.tmp"));
        assert_eq!(std::fs::read_to_string(&asset.path).unwrap(), "opus-bytes");
    }
}
