//! Audio transcoding using FFmpeg

use crate::downloader::DownloadedAsset;
use crate::error::TranscodeError;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

/// Extension of every transcoded audio file
pub const AUDIO_EXTENSION: &str = "mp3";

#[derive(Debug, Clone)]
pub struct Encoder {
    ffmpeg_path: PathBuf,
}

impl Encoder {
    pub fn new(ffmpeg_path: PathBuf) -> Self {
        Self { ffmpeg_path }
    }

    pub fn path(&self) -> &Path {
        &self.ffmpeg_path
    }

    /// Convert a downloaded stream to MP3 next to it and delete the source
    pub async fn transcode(&self, asset: DownloadedAsset) -> Result<DownloadedAsset, TranscodeError> {
        if !self.ffmpeg_path.exists() {
            return Err(TranscodeError::EncoderNotFound(self.ffmpeg_path.clone()));
        }

        let output = target_path(&asset.path);
        info!("Start audio convert");

        let result = Command::new(&self.ffmpeg_path)
            .args(["-hide_banner", "-loglevel", "error", "-y"])
            .arg("-i")
            .arg(&asset.path)
            .arg(&output)
            .kill_on_drop(true)
            .output()
            .await?;

        let stderr = String::from_utf8_lossy(&result.stderr).trim().to_string();
        if !stderr.is_empty() {
            debug!("ffmpeg stderr: {}", stderr);
        }

        if !result.status.success() {
            return Err(TranscodeError::EncoderFailed {
                code: result.status.code(),
                stderr,
            });
        }

        tokio::fs::remove_file(&asset.path).await?;
        debug!("Encoded to: {}", output.display());
        info!("Finished audio convert");

        Ok(DownloadedAsset {
            path: output,
            extension: AUDIO_EXTENSION.to_string(),
        })
    }
}

/// `<dir>/<id>.audiovideo.tmp` -> `<dir>/<id>.mp3`
fn target_path(source: &Path) -> PathBuf {
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = name.split('.').next().filter(|s| !s.is_empty()).unwrap_or("audio");
    source.with_file_name(format!("{}.{}", stem, AUDIO_EXTENSION))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_path() {
        assert_eq!(
            target_path(Path::new("tmp/abc.audiovideo.tmp")),
            PathBuf::from("tmp/abc.mp3")
        );
        assert_eq!(target_path(Path::new("tmp/.hidden")), PathBuf::from("tmp/audio.mp3"));
    }

    #[tokio::test]
    async fn test_missing_encoder() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = Encoder::new(dir.path().join("ffmpeg"));
        let asset = DownloadedAsset {
            path: dir.path().join("a.audiovideo.tmp"),
            extension: "webm".to_string(),
        };
        let err = encoder.transcode(asset).await.unwrap_err();
        assert!(matches!(err, TranscodeError::EncoderNotFound(_)));
    }

    #[cfg(unix)]
    fn stub(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("ffmpeg");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_transcode_replaces_source() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = Encoder::new(stub(dir.path(), r#"for a; do out="$a"; done; echo mp3 > "$out""#));
        let source = dir.path().join("abc.audiovideo.tmp");
        std::fs::write(&source, "webm").unwrap();

        let asset = encoder
            .transcode(DownloadedAsset {
                path: source.clone(),
                extension: "webm".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(asset.path, dir.path().join("abc.mp3"));
        assert_eq!(asset.extension, "mp3");
        assert!(asset.path.exists());
        assert!(!source.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = Encoder::new(stub(dir.path(), "echo 'Invalid data' >&2; exit 3"));
        let source = dir.path().join("abc.audiovideo.tmp");
        std::fs::write(&source, "junk").unwrap();

        let err = encoder
            .transcode(DownloadedAsset {
                path: source.clone(),
                extension: "webm".to_string(),
            })
            .await
            .unwrap_err();

        match err {
            TranscodeError::EncoderFailed { code, stderr } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "Invalid data");
            }
            other => panic!("unexpected error: {other}"),
        }
        // Source is kept for inspection
        assert!(source.exists());
    }
}
