//! Configuration management for usdbfetch

use crate::error::ConfigError;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub paths: PathsConfig,
    pub usdb: UsdbConfig,
    pub youtube: YoutubeConfig,
    pub encoder: EncoderConfig,
    pub timeouts: TimeoutsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Scratch directory, wiped at the start of every run
    pub scratch: PathBuf,
    /// Completed packages land here; never cleared
    pub output: PathBuf,
    /// Encoder binary location (downloaded here when missing)
    pub encoder: PathBuf,
    /// Path to yt-dlp binary (auto-detected if not set)
    pub yt_dlp: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsdbConfig {
    /// Base URL of the JSON player API
    pub api_base: String,
    /// Base URL of the site serving song downloads
    pub site_base: String,
    /// Wait between session creation and the download request
    pub handshake_delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YoutubeConfig {
    /// Prefix joined with the video id to form the watch URL
    pub watch_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Release archive fetched when the encoder binary is missing
    pub archive_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    /// Single API request (metadata, session, content, cover)
    pub request_secs: u64,
    /// Whole media stream or archive transfer
    pub transfer_secs: u64,
    /// yt-dlp and encoder subprocesses
    pub process_secs: u64,
}

const DEFAULT_HANDSHAKE_DELAY_SECS: u64 = 22;

#[cfg(windows)]
const DEFAULT_ENCODER_BINARY: &str = "ffmpeg.exe";
#[cfg(not(windows))]
const DEFAULT_ENCODER_BINARY: &str = "ffmpeg";

#[cfg(windows)]
const DEFAULT_ENCODER_ARCHIVE: &str =
    "https://www.gyan.dev/ffmpeg/builds/ffmpeg-release-essentials.zip";
#[cfg(target_os = "macos")]
const DEFAULT_ENCODER_ARCHIVE: &str = "https://evermeet.cx/ffmpeg/getrelease/zip";
#[cfg(not(any(windows, target_os = "macos")))]
const DEFAULT_ENCODER_ARCHIVE: &str = "https://github.com/BtbN/FFmpeg-Builds/releases/download/latest/ffmpeg-master-latest-linux64-gpl.tar.xz";

impl Default for Config {
    fn default() -> Self {
        Self {
            paths: PathsConfig {
                scratch: PathBuf::from("tmp"),
                output: PathBuf::from("done"),
                encoder: PathBuf::from(DEFAULT_ENCODER_BINARY),
                yt_dlp: None,
            },
            usdb: UsdbConfig {
                api_base: "https://player.usdb.eu".to_string(),
                site_base: "https://usdb.eu".to_string(),
                handshake_delay_secs: DEFAULT_HANDSHAKE_DELAY_SECS,
            },
            youtube: YoutubeConfig {
                watch_prefix: "https://www.youtube.com/watch?v=".to_string(),
            },
            encoder: EncoderConfig {
                archive_url: DEFAULT_ENCODER_ARCHIVE.to_string(),
            },
            timeouts: TimeoutsConfig {
                request_secs: 60,
                transfer_secs: 1800,
                process_secs: 600,
            },
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        if let Some(path) = Self::default_file() {
            if path.exists() {
                figment = figment.merge(Toml::file(&path));
            }
        }

        if let Some(path) = config_file {
            if !path.exists() {
                return Err(ConfigError::LoadError(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }

        // USDBFETCH_USDB__HANDSHAKE_DELAY_SECS=0 -> usdb.handshake_delay_secs
        figment = figment.merge(Env::prefixed("USDBFETCH_").split("__"));

        let config: Config = figment
            .extract()
            .map_err(|e| ConfigError::LoadError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Per-user config file location
    pub fn default_file() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("usdbfetch/config.toml"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.paths.scratch == self.paths.output {
            return Err(ConfigError::InvalidValue(
                "paths.scratch and paths.output must differ".to_string(),
            ));
        }
        if self.paths.output.starts_with(&self.paths.scratch) {
            return Err(ConfigError::InvalidValue(
                "paths.output must not live inside paths.scratch".to_string(),
            ));
        }
        if self.paths.encoder.file_name().is_none() {
            return Err(ConfigError::InvalidValue(
                "paths.encoder must name a file".to_string(),
            ));
        }
        let timeouts = &self.timeouts;
        if timeouts.request_secs == 0 || timeouts.transfer_secs == 0 || timeouts.process_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "timeouts must be at least one second".to_string(),
            ));
        }
        if self.youtube.watch_prefix.is_empty() {
            return Err(ConfigError::InvalidValue(
                "youtube.watch_prefix is empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Get yt-dlp path, auto-detecting if not configured
    pub fn yt_dlp_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(ref path) = self.paths.yt_dlp {
            Ok(path.clone())
        } else {
            which::which("yt-dlp")
                .map_err(|_| ConfigError::InvalidValue("yt-dlp not found in PATH".to_string()))
        }
    }

    pub fn handshake_delay(&self) -> Duration {
        Duration::from_secs(self.usdb.handshake_delay_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.request_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.transfer_secs)
    }

    pub fn process_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.process_secs)
    }

    /// Rebase the three working paths under `root`
    pub fn rooted_at(mut self, root: &Path) -> Self {
        self.paths.scratch = root.join(&self.paths.scratch);
        self.paths.output = root.join(&self.paths.output);
        self.paths.encoder = root.join(&self.paths.encoder);
        self
    }
}
