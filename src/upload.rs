use std::io;
use std::path::{Path, PathBuf};

use image::ImageFormat;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;

/// MIME type sent when neither the bytes nor the client tell us anything.
pub const FALLBACK_MIME_TYPE: &str = "image/png";

/// An uploaded file staged on disk for the lifetime of one request.
///
/// The file is removed when the value is dropped, so every exit path of the
/// handler (including cancellation) cleans up.
#[derive(Debug)]
pub struct StagedUpload {
    file: NamedTempFile,
}

impl StagedUpload {
    /// Creates an empty, uniquely named file inside `dir`.
    pub async fn create(dir: &Path) -> io::Result<Self> {
        tokio::fs::create_dir_all(dir).await?;

        let dir: PathBuf = dir.to_path_buf();
        let file = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix("upload-")
                .tempfile_in(&dir)
        })
        .await
        .map_err(io::Error::other)??;

        Ok(StagedUpload { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub async fn writer(&self) -> io::Result<UploadWriter> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(self.path())
            .await?;
        Ok(UploadWriter {
            file,
            written: 0,
        })
    }

    pub async fn read(&self) -> io::Result<Vec<u8>> {
        tokio::fs::read(self.path()).await
    }

    /// Removes the file now and reports failures, instead of leaving it to
    /// `Drop`, which swallows them.
    pub fn close(self) -> io::Result<()> {
        self.file.close()
    }
}

pub struct UploadWriter {
    file: tokio::fs::File,
    written: usize,
}

impl UploadWriter {
    pub async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.file.write_all(chunk).await?;
        self.written += chunk.len();
        Ok(())
    }

    /// Flushes to disk and returns the number of bytes written.
    pub async fn finish(mut self) -> io::Result<usize> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(self.written)
    }
}

/// Picks the MIME type to declare upstream.
///
/// Magic bytes win over whatever the client claimed; a non-image claim is
/// ignored.
pub fn detect_mime_type(bytes: &[u8], declared: Option<&str>) -> String {
    if let Some(mime) = image::guess_format(bytes).ok().and_then(mime_for_format) {
        return mime.to_string();
    }

    match declared {
        Some(declared) if declared.starts_with("image/") => declared.to_string(),
        _ => FALLBACK_MIME_TYPE.to_string(),
    }
}

fn mime_for_format(format: ImageFormat) -> Option<&'static str> {
    match format {
        ImageFormat::Png => Some("image/png"),
        ImageFormat::Jpeg => Some("image/jpeg"),
        ImageFormat::WebP => Some("image/webp"),
        ImageFormat::Gif => Some("image/gif"),
        ImageFormat::Bmp => Some("image/bmp"),
        ImageFormat::Tiff => Some("image/tiff"),
        _ => None,
    }
}
