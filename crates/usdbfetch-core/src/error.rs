//! Error types for usdbfetch-core

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, UsdbError>;

#[derive(Error, Debug)]
pub enum UsdbError {
    #[error("Metadata fetch failed: {0}")]
    Metadata(#[from] MetadataError),

    #[error("Song content fetch failed: {0}")]
    Content(#[from] ContentError),

    #[error("Download failed: {0}")]
    Download(#[from] DownloadError),

    #[error("Transcode failed: {0}")]
    Transcode(#[from] TranscodeError),

    #[error("Bootstrap failed: {0}")]
    Bootstrap(#[from] BootstrapError),

    #[error("Assembly failed: {0}")]
    Assemble(#[from] AssembleError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("{operation} timed out after {seconds} seconds")]
    Timeout { operation: &'static str, seconds: u64 },

    #[error("Cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Metadata endpoint returned HTTP {0}")]
    Status(reqwest::StatusCode),

    #[error("Metadata payload too short to unwrap ({0} bytes)")]
    Truncated(usize),

    #[error("Failed to parse metadata: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ContentError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Download endpoint returned HTTP {0}")]
    Status(reqwest::StatusCode),

    #[error("Session cookie {0} was not set by the server")]
    MissingSessionCookie(&'static str),

    #[error("Response carries no Content-Disposition filename")]
    MissingContentDisposition,
}

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("yt-dlp not found. Install it or set paths.yt_dlp")]
    YtDlpNotFound,

    #[error("yt-dlp failed with exit code {code:?}: {stderr}")]
    YtDlpFailed { code: Option<i32>, stderr: String },

    #[error("Not a YouTube video id or link: {0:?}")]
    InvalidVideoId(String),

    #[error("Failed to parse format list: {0}")]
    MetadataParse(#[from] serde_json::Error),

    #[error("No downloadable {0} stream available")]
    NoVariants(&'static str),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Stream host returned HTTP {0}")]
    Status(reqwest::StatusCode),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("Encoder not found at {0}")]
    EncoderNotFound(PathBuf),

    #[error("Encoder failed with exit code {code:?}: {stderr}")]
    EncoderFailed { code: Option<i32>, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("Failed to download encoder archive: {0}")]
    Download(#[from] reqwest::Error),

    #[error("Encoder archive host returned HTTP {0}")]
    Status(reqwest::StatusCode),

    #[error("Failed to extract encoder archive: {0}")]
    Extract(String),

    #[error("No file named {0} found in the encoder archive")]
    BinaryNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum AssembleError {
    #[error("Failed to download cover image: {0}")]
    Cover(#[from] reqwest::Error),

    #[error("Cover host returned HTTP {0}")]
    CoverStatus(reqwest::StatusCode),

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to move {from} to {to}: {source}")]
    Move {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    LoadError(String),

    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}
