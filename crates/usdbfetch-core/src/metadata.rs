//! Song metadata lookup against the USDB player API

use crate::error::MetadataError;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

/// What the player API knows about a song.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SongMetadata {
    pub cover_url: String,
    pub youtube_id: String,
    pub artist: String,
    pub title: String,
    pub display_title: String,
}

#[derive(Debug, Deserialize)]
struct SongInfo {
    title: Labelled,
    artist: Labelled,
    youtube: String,
}

#[derive(Debug, Deserialize)]
struct Labelled {
    label: String,
    #[serde(default)]
    link: Option<String>,
}

#[derive(Debug)]
pub struct MetadataFetcher {
    client: reqwest::Client,
    api_base: String,
    timeout: Duration,
}

impl MetadataFetcher {
    pub fn new(client: reqwest::Client, api_base: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            api_base: api_base.into(),
            timeout,
        }
    }

    /// Fetch metadata for one song id
    pub async fn fetch(&self, song_id: u32) -> Result<SongMetadata, MetadataError> {
        let url = format!("{}/2.0.0/json.php", self.api_base.trim_end_matches('/'));
        info!("Fetching metadata for song {}", song_id);

        let resp = self
            .client
            .get(&url)
            .query(&[("songFile", song_id)])
            .timeout(self.timeout)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(MetadataError::Status(resp.status()));
        }

        let body = resp.text().await?;
        debug!("Metadata payload: {} bytes", body.len());

        parse_wrapped(&body)
    }
}

/// Parse the API payload, which wraps the JSON object in one extra
/// character on each side.
pub fn parse_wrapped(body: &str) -> Result<SongMetadata, MetadataError> {
    let body = body.trim();
    if body.chars().count() < 2 {
        return Err(MetadataError::Truncated(body.len()));
    }

    let mut chars = body.chars();
    chars.next();
    chars.next_back();

    let info: SongInfo = serde_json::from_str(chars.as_str())?;
    let cover_url = info.title.link.unwrap_or_default();

    Ok(SongMetadata {
        display_title: format!("{} - {}", info.artist.label, info.title.label),
        cover_url,
        youtube_id: info.youtube,
        artist: info.artist.label,
        title: info.title.label,
    })
}
