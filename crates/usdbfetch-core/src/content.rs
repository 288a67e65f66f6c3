//! Song text download behind the USDB session handshake
//!
//! The download endpoint only answers for a session that was opened at
//! least `handshake_delay` earlier. A run therefore posts to `/download`,
//! waits the full delay, then replays the `PHPSESSID` cookie by hand.

use crate::error::ContentError;
use percent_encoding::percent_decode_str;
use regex::Regex;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{HeaderValue, CONTENT_DISPOSITION, COOKIE};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const SESSION_COOKIE: &str = "PHPSESSID";

/// Raw song text plus the filename the server suggested for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SongContent {
    pub text: String,
    pub server_filename: String,
}

#[derive(Debug)]
pub struct ContentFetcher {
    client: reqwest::Client,
    jar: Arc<Jar>,
    site_base: String,
    handshake_delay: Duration,
    timeout: Duration,
}

impl ContentFetcher {
    /// `client` must store its cookies in `jar`
    pub fn new(
        client: reqwest::Client,
        jar: Arc<Jar>,
        site_base: impl Into<String>,
        handshake_delay: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            jar,
            site_base: site_base.into(),
            handshake_delay,
            timeout,
        }
    }

    pub fn handshake_delay(&self) -> Duration {
        self.handshake_delay
    }

    /// Open a session and return its cookie value
    pub async fn open_session(&self) -> Result<String, ContentError> {
        let url = format!("{}/download", self.base());
        debug!("Opening session: POST {}", url);

        let resp = self.client.post(&url).timeout(self.timeout).send().await?;
        if !resp.status().is_success() {
            return Err(ContentError::Status(resp.status()));
        }

        // The cookie may have been set on a redirect hop, so ask the jar
        let session = reqwest::Url::parse(&url)
            .ok()
            .and_then(|site| self.jar.cookies(&site))
            .and_then(|header| cookie_value(&header, SESSION_COOKIE))
            .ok_or(ContentError::MissingSessionCookie(SESSION_COOKIE))?;
        Ok(session)
    }

    /// Download the song text using an already opened session
    pub async fn download(&self, song_id: u32, session: &str) -> Result<SongContent, ContentError> {
        let url = format!("{}/download/{}", self.base(), song_id);
        debug!("Downloading song text: GET {}", url);

        let resp = self
            .client
            .get(&url)
            .header(COOKIE, format!("{}={}", SESSION_COOKIE, session))
            .timeout(self.timeout)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(ContentError::Status(resp.status()));
        }

        let server_filename = resp
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(disposition_filename)
            .ok_or(ContentError::MissingContentDisposition)?;

        let text = resp.text().await?;

        Ok(SongContent {
            text,
            server_filename,
        })
    }

    /// Full handshake: session, fixed wait, download
    pub async fn fetch(&self, song_id: u32) -> Result<SongContent, ContentError> {
        info!("Start song content download");

        let session = self.open_session().await?;

        debug!("Waiting {}s for the session to mature", self.handshake_delay.as_secs());
        tokio::time::sleep(self.handshake_delay).await;

        let content = self.download(song_id, &session).await?;
        info!("Finished song content download: {}", content.server_filename);
        Ok(content)
    }

    fn base(&self) -> &str {
        self.site_base.trim_end_matches('/')
    }
}

/// Look up `name` in a `Cookie` request header value
fn cookie_value(header: &HeaderValue, name: &str) -> Option<String> {
    header
        .to_str()
        .ok()?
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

/// Filename from a Content-Disposition value. Raw bytes are read as UTF-8
/// and an RFC 5987 `filename*=` parameter wins over plain `filename=`.
fn disposition_filename(value: &HeaderValue) -> Option<String> {
    let header = String::from_utf8_lossy(value.as_bytes());
    extended_filename(&header).or_else(|| attachment_filename(&header))
}

/// Decode `filename*=<charset>'<lang>'<percent-encoded>`
fn extended_filename(header: &str) -> Option<String> {
    let re = Regex::new(r"(?i)filename\*\s*=\s*[^']*'[^']*'([^;]*)").ok()?;

    let encoded = re.captures(header)?.get(1)?.as_str().trim();
    let name = percent_decode_str(encoded).decode_utf8_lossy();
    if name.is_empty() {
        None
    } else {
        Some(name.into_owned())
    }
}

/// Extract `<name>` from `attachment; filename=<name>`
fn attachment_filename(header: &str) -> Option<String> {
    let re = Regex::new(r#"(?i)filename\s*=\s*(?:"([^"]*)"|([^;]*))"#).ok()?;

    let caps = re.captures(header)?;
    let name = caps.get(1).or_else(|| caps.get(2))?.as_str().trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}
