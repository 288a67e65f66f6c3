//! Shared HTTP client construction

use crate::config::Config;
use reqwest::cookie::Jar;
use std::sync::Arc;
use std::time::Duration;

const USER_AGENT: &str = concat!("usdbfetch/", env!("CARGO_PKG_VERSION"));

fn builder(config: &Config) -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(Duration::from_secs(config.timeouts.request_secs.min(30)))
}

/// Build the client used for metadata, media, cover and archive requests.
pub fn build_client(config: &Config) -> reqwest::Result<reqwest::Client> {
    builder(config).build()
}

/// Build the client for the USDB download handshake.
///
/// Cookies set on any hop of a redirect chain end up in `jar`.
pub fn build_session_client(config: &Config, jar: Arc<Jar>) -> reqwest::Result<reqwest::Client> {
    builder(config).cookie_provider(jar).build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clients_build_from_defaults() {
        let config = Config::default();
        assert!(build_client(&config).is_ok());
        assert!(build_session_client(&config, Arc::new(Jar::default())).is_ok());
    }
}
