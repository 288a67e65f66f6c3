//! Builds the final song folder from the fetched pieces

use crate::content::SongContent;
use crate::downloader::DownloadedAsset;
use crate::error::AssembleError;
use crate::metadata::SongMetadata;
use crate::song_file::SongFile;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT_COVER_EXTENSION: &str = "jpg";

/// Replace characters that are not allowed in file names with a space
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '\\' | '/' | '"' | '*' | ':' | '?' => ' ',
            _ => c,
        })
        .collect()
}

/// `"<Artist> - <Title>"`, preferring the song text's own header fields
pub fn song_label(song: &SongFile, metadata: &SongMetadata) -> String {
    let artist = song.field("ARTIST").filter(|s| !s.is_empty());
    let title = song.field("TITLE").filter(|s| !s.is_empty());
    match (artist, title) {
        (Some(artist), Some(title)) => format!("{} - {}", artist, title),
        _ => metadata.display_title.clone(),
    }
}

/// Extension of the cover image, taken from the URL path
pub fn cover_extension(cover_url: &str) -> String {
    reqwest::Url::parse(cover_url)
        .ok()
        .and_then(|url| {
            let segment = url.path_segments()?.last()?.to_string();
            let (_, ext) = segment.rsplit_once('.')?;
            let ext = ext.to_ascii_lowercase();
            (!ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric())).then_some(ext)
        })
        .unwrap_or_else(|| DEFAULT_COVER_EXTENSION.to_string())
}

/// First of `root/name`, `root/name_1`, `root/name_2`, ... that does not exist
pub fn unique_destination(root: &Path, name: &str) -> PathBuf {
    let mut candidate = root.join(name);
    let mut n = 1;
    while candidate.exists() {
        candidate = root.join(format!("{}_{}", name, n));
        n += 1;
    }
    candidate
}

/// Download the cover image bytes
pub async fn fetch_cover(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<Vec<u8>, AssembleError> {
    debug!("Fetching cover {}", url);
    let resp = client.get(url).timeout(timeout).send().await?;
    if !resp.status().is_success() {
        return Err(AssembleError::CoverStatus(resp.status()));
    }
    Ok(resp.bytes().await?.to_vec())
}

/// Everything that goes into one song folder.
#[derive(Debug)]
pub struct SongParts {
    pub metadata: SongMetadata,
    pub content: SongContent,
    /// `None` when the song has no cover link
    pub cover: Option<Vec<u8>>,
    pub video: DownloadedAsset,
    pub audio: DownloadedAsset,
}

#[derive(Debug, Clone)]
pub struct Assembler {
    scratch_dir: PathBuf,
    output_dir: PathBuf,
}

impl Assembler {
    pub fn new(scratch_dir: PathBuf, output_dir: PathBuf) -> Self {
        Self {
            scratch_dir,
            output_dir,
        }
    }

    /// Stage all files under `<scratch>/<label>` and move the folder into
    /// the output directory. Returns the final folder.
    pub async fn assemble(&self, song_id: u32, parts: SongParts) -> Result<PathBuf, AssembleError> {
        let SongParts {
            metadata,
            content,
            cover,
            video,
            audio,
        } = parts;

        let mut song = SongFile::parse(&content.text);
        let label = sanitize_filename(&song_label(&song, &metadata));
        info!("Assembling song {} as {:?}", song_id, label);

        let song_dir = self.scratch_dir.join(&label);
        tokio::fs::create_dir_all(&song_dir)
            .await
            .map_err(|source| AssembleError::Write {
                path: song_dir.clone(),
                source,
            })?;

        if let Some(bytes) = cover {
            let cover_name = format!("{}.{}", label, cover_extension(&metadata.cover_url));
            write_file(&song_dir.join(&cover_name), &bytes).await?;
            song.set_field("COVER", &cover_name);
        }

        let video_name = format!("{}.{}", label, video.extension);
        move_path(&video.path, &song_dir.join(&video_name)).await?;
        song.set_field("VIDEO", &video_name);

        let audio_name = format!("{}.{}", label, audio.extension);
        move_path(&audio.path, &song_dir.join(&audio_name)).await?;
        song.set_field("MP3", &audio_name);

        let text_name = format!("{}.txt", label);
        write_file(&song_dir.join(&text_name), song.to_string().as_bytes()).await?;

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|source| AssembleError::Write {
                path: self.output_dir.clone(),
                source,
            })?;

        let destination = unique_destination(&self.output_dir, &label);
        move_path(&song_dir, &destination).await?;

        info!("Song folder ready: {}", destination.display());
        Ok(destination)
    }
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<(), AssembleError> {
    tokio::fs::write(path, bytes)
        .await
        .map_err(|source| AssembleError::Write {
            path: path.to_path_buf(),
            source,
        })
}

async fn move_path(from: &Path, to: &Path) -> Result<(), AssembleError> {
    debug!("Moving {} -> {}", from.display(), to.display());
    tokio::fs::rename(from, to)
        .await
        .map_err(|source| AssembleError::Move {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            source,
        })
}
