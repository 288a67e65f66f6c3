//! usdbfetch-core: UltraStar song package retrieval from USDB and YouTube

pub mod assembler;
pub mod bootstrap;
pub mod config;
pub mod content;
pub mod downloader;
pub mod encoder;
pub mod error;
pub mod http;
pub mod metadata;
pub mod pipeline;
pub mod song_file;

pub use config::Config;
pub use error::{Result, UsdbError};
