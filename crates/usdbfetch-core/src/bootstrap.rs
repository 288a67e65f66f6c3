//! Scratch directory lifecycle and first-run encoder installation

use crate::error::BootstrapError;
use futures::StreamExt;
use std::fs;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Per-run working directory.
///
/// Wiped and recreated at start, removed after a successful run and left
/// behind after a failure.
#[derive(Debug, Clone)]
pub struct Scratch {
    root: PathBuf,
}

impl Scratch {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub async fn prepare(&self) -> io::Result<()> {
        if tokio::fs::try_exists(&self.root).await? {
            debug!("Clearing leftover scratch directory {}", self.root.display());
            tokio::fs::remove_dir_all(&self.root).await?;
        }
        tokio::fs::create_dir_all(&self.root).await
    }

    pub async fn remove(&self) -> io::Result<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
    TarXz,
}

impl ArchiveFormat {
    /// Guess from the URL path; anything unrecognised is treated as zip
    pub fn from_url(url: &str) -> Self {
        let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
        if path.ends_with(".tar.xz") || path.ends_with(".txz") {
            ArchiveFormat::TarXz
        } else if path.ends_with(".tar.gz") || path.ends_with(".tgz") {
            ArchiveFormat::TarGz
        } else {
            ArchiveFormat::Zip
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::TarGz => "tar.gz",
            ArchiveFormat::TarXz => "tar.xz",
        }
    }
}

/// Downloads and installs the encoder binary when it is missing.
#[derive(Debug, Clone)]
pub struct EncoderBootstrap {
    client: reqwest::Client,
    archive_url: String,
    encoder_path: PathBuf,
    scratch_dir: PathBuf,
}

impl EncoderBootstrap {
    pub fn new(
        client: reqwest::Client,
        archive_url: impl Into<String>,
        encoder_path: PathBuf,
        scratch_dir: PathBuf,
    ) -> Self {
        Self {
            client,
            archive_url: archive_url.into(),
            encoder_path,
            scratch_dir,
        }
    }

    /// Make sure the encoder exists at its configured path
    pub async fn ensure_available(
        &self,
        progress: impl Fn(u64, Option<u64>),
    ) -> Result<PathBuf, BootstrapError> {
        if self.encoder_path.exists() {
            debug!("Encoder present at {}", self.encoder_path.display());
            return Ok(self.encoder_path.clone());
        }

        info!("Download ffmpeg from {}", self.archive_url);
        let format = ArchiveFormat::from_url(&self.archive_url);
        let archive = self
            .scratch_dir
            .join(format!("encoder-archive.{}", format.extension()));
        self.download_archive(&archive, progress).await?;

        let extract_dir = self.scratch_dir.join("encoder-archive");
        let binary_name = self
            .encoder_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let found = {
            let archive = archive.clone();
            let extract_dir = extract_dir.clone();
            tokio::task::spawn_blocking(move || {
                extract(&archive, format, &extract_dir)?;
                find_file(&extract_dir, &binary_name)
            })
            .await
            .map_err(|e| BootstrapError::Extract(e.to_string()))??
        };

        install(&found, &self.encoder_path)?;
        info!("Finished downloading ffmpeg to {}", self.encoder_path.display());
        Ok(self.encoder_path.clone())
    }

    async fn download_archive(
        &self,
        dest: &Path,
        progress: impl Fn(u64, Option<u64>),
    ) -> Result<(), BootstrapError> {
        let response = self.client.get(&self.archive_url).send().await?;
        if !response.status().is_success() {
            return Err(BootstrapError::Status(response.status()));
        }

        let total = response.content_length();
        let mut file = tokio::fs::File::create(dest).await?;
        let mut downloaded: u64 = 0;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            progress(downloaded, total);
        }
        file.flush().await?;

        debug!("Archive saved to {} ({} bytes)", dest.display(), downloaded);
        Ok(())
    }
}

fn extract(archive: &Path, format: ArchiveFormat, dest: &Path) -> Result<(), BootstrapError> {
    debug!("Extracting {} into {}", archive.display(), dest.display());
    fs::create_dir_all(dest)?;
    let file = fs::File::open(archive)?;

    match format {
        ArchiveFormat::Zip => {
            let mut zip = zip::ZipArchive::new(file)
                .map_err(|e| BootstrapError::Extract(e.to_string()))?;
            zip.extract(dest)
                .map_err(|e| BootstrapError::Extract(e.to_string()))?;
        }
        ArchiveFormat::TarGz => {
            let decoder = flate2::read::GzDecoder::new(file);
            tar::Archive::new(decoder)
                .unpack(dest)
                .map_err(|e| BootstrapError::Extract(e.to_string()))?;
        }
        ArchiveFormat::TarXz => {
            // The decompressed tar goes to disk next to the archive
            let tar_path = archive.with_extension("");
            {
                let mut out = BufWriter::new(fs::File::create(&tar_path)?);
                lzma_rs::xz_decompress(&mut BufReader::new(file), &mut out)
                    .map_err(|e| BootstrapError::Extract(e.to_string()))?;
                out.flush()?;
            }
            tar::Archive::new(BufReader::new(fs::File::open(&tar_path)?))
                .unpack(dest)
                .map_err(|e| BootstrapError::Extract(e.to_string()))?;
            fs::remove_file(&tar_path)?;
        }
    }
    Ok(())
}

/// First regular file named `name` anywhere below `root`
fn find_file(root: &Path, name: &str) -> Result<PathBuf, BootstrapError> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .find(|entry| entry.file_name().to_string_lossy() == name)
        .map(|entry| entry.into_path())
        .ok_or_else(|| BootstrapError::BinaryNotFound(name.to_string()))
}

fn install(found: &Path, dest: &Path) -> Result<(), BootstrapError> {
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    if let Err(e) = fs::rename(found, dest) {
        warn!("Rename failed ({}), copying encoder instead", e);
        fs::copy(found, dest)?;
        fs::remove_file(found)?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dest, fs::Permissions::from_mode(0o755))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use std::io::{Cursor, Write};

    fn zip_with(path: &str, body: &[u8]) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file("README.txt", options).unwrap();
            writer.write_all(b"release notes").unwrap();
            writer.start_file(path, options).unwrap();
            writer.write_all(body).unwrap();
            writer.finish().unwrap();
        }
        buf.into_inner()
    }

    fn tar_gz_with(path: &str, body: &[u8]) -> Vec<u8> {
        let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        let mut builder = tar::Builder::new(encoder);
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, path, body).unwrap();
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn tar_xz_with(path: &str, body: &[u8]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, path, body).unwrap();
        let tar = builder.into_inner().unwrap();

        let mut out = Vec::new();
        lzma_rs::xz_compress(&mut Cursor::new(tar), &mut out).unwrap();
        out
    }

    #[test]
    fn test_archive_format_from_url() {
        assert_eq!(
            ArchiveFormat::from_url("https://www.gyan.dev/ffmpeg/builds/ffmpeg-release-essentials.zip"),
            ArchiveFormat::Zip
        );
        assert_eq!(
            ArchiveFormat::from_url("https://x/ffmpeg-master-latest-linux64-gpl.tar.xz"),
            ArchiveFormat::TarXz
        );
        assert_eq!(ArchiveFormat::from_url("https://x/ff.TGZ?sig=1"), ArchiveFormat::TarGz);
        assert_eq!(ArchiveFormat::from_url("https://evermeet.cx/ffmpeg/getrelease/zip"), ArchiveFormat::Zip);
    }

    #[tokio::test]
    async fn test_scratch_prepare_wipes_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = Scratch::new(dir.path().join("tmp"));
        std::fs::create_dir_all(scratch.path().join("Old - Song")).unwrap();
        std::fs::write(scratch.path().join("abc.video.tmp"), "stale").unwrap();

        scratch.prepare().await.unwrap();
        assert!(scratch.path().is_dir());
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);

        scratch.remove().await.unwrap();
        assert!(!scratch.path().exists());
        // Removing twice is fine
        scratch.remove().await.unwrap();
    }

    #[tokio::test]
    async fn test_present_encoder_skips_download() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = dir.path().join("ffmpeg");
        std::fs::write(&encoder, "bin").unwrap();

        let bootstrap = EncoderBootstrap::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9/never.zip",
            encoder.clone(),
            dir.path().join("tmp"),
        );
        assert_eq!(bootstrap.ensure_available(|_, _| {}).await.unwrap(), encoder);
    }

    #[tokio::test]
    async fn test_installs_from_zip() {
        let server = MockServer::start_async().await;
        let m = server
            .mock_async(|when, then| {
                when.method(GET).path("/ffmpeg-release-essentials.zip");
                then.status(200)
                    .body(zip_with("ffmpeg-7.1-essentials_build/bin/ffmpeg", b"ELF"));
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let scratch = Scratch::new(dir.path().join("tmp"));
        scratch.prepare().await.unwrap();
        let encoder = dir.path().join("ffmpeg");

        let bootstrap = EncoderBootstrap::new(
            reqwest::Client::new(),
            server.url("/ffmpeg-release-essentials.zip"),
            encoder.clone(),
            scratch.path().to_path_buf(),
        );
        bootstrap.ensure_available(|_, _| {}).await.unwrap();

        m.assert_async().await;
        assert_eq!(std::fs::read(&encoder).unwrap(), b"ELF");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&encoder).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }

    #[tokio::test]
    async fn test_installs_from_tar_gz() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.path("/ffmpeg.tar.gz");
                then.status(200).body(tar_gz_with("ffmpeg-build/bin/ffmpeg", b"ELF"));
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("tmp")).unwrap();
        let encoder = dir.path().join("bin/ffmpeg");

        let bootstrap = EncoderBootstrap::new(
            reqwest::Client::new(),
            server.url("/ffmpeg.tar.gz"),
            encoder.clone(),
            dir.path().join("tmp"),
        );
        bootstrap.ensure_available(|_, _| {}).await.unwrap();
        assert_eq!(std::fs::read(&encoder).unwrap(), b"ELF");
    }

    #[tokio::test]
    async fn test_installs_from_tar_xz() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.path("/ffmpeg-master-latest-linux64-gpl.tar.xz");
                then.status(200)
                    .body(tar_xz_with("ffmpeg-master-latest-linux64-gpl/bin/ffmpeg", b"ELF"));
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("tmp");
        std::fs::create_dir_all(&scratch).unwrap();
        let encoder = dir.path().join("ffmpeg");

        let bootstrap = EncoderBootstrap::new(
            reqwest::Client::new(),
            server.url("/ffmpeg-master-latest-linux64-gpl.tar.xz"),
            encoder.clone(),
            scratch.clone(),
        );
        bootstrap.ensure_available(|_, _| {}).await.unwrap();

        assert_eq!(std::fs::read(&encoder).unwrap(), b"ELF");
        // Intermediate tar is not left in scratch
        assert!(!scratch.join("encoder-archive.tar").exists());
    }

    #[tokio::test]
    async fn test_archive_without_binary() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.path("/build.zip");
                then.status(200).body(zip_with("bin/ffprobe", b"ELF"));
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("tmp")).unwrap();

        let bootstrap = EncoderBootstrap::new(
            reqwest::Client::new(),
            server.url("/build.zip"),
            dir.path().join("ffmpeg"),
            dir.path().join("tmp"),
        );
        let err = bootstrap.ensure_available(|_, _| {}).await.unwrap_err();
        assert!(matches!(err, BootstrapError::BinaryNotFound(name) if name == "ffmpeg"));
    }

    #[tokio::test]
    async fn test_archive_host_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.path("/build.zip");
                then.status(404);
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("tmp")).unwrap();
        let bootstrap = EncoderBootstrap::new(
            reqwest::Client::new(),
            server.url("/build.zip"),
            dir.path().join("ffmpeg"),
            dir.path().join("tmp"),
        );
        let err = bootstrap.ensure_available(|_, _| {}).await.unwrap_err();
        assert!(matches!(err, BootstrapError::Status(s) if s.as_u16() == 404));
    }
}
