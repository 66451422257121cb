// src/output.rs

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter, SeekFrom};

/// A partially written download destination.
///
/// Writes go through a buffer and only become durable once
/// [`flush_and_sync`](Self::flush_and_sync) returns. The handle is released by
/// [`close`](Self::close) or, on error paths, when the value is dropped.
#[derive(Debug)]
pub struct ResumableFileOutput {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    position: u64,
}

impl ResumableFileOutput {
    /// Opens `path` for writing, creating it and its parent directories if needed.
    /// An existing partial file is never truncated.
    pub async fn open(path: impl Into<PathBuf>, buffer_size: usize) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            writer: Some(BufWriter::with_capacity(buffer_size, file)),
            position: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset the next write lands at.
    pub fn position(&self) -> u64 {
        self.position
    }

    fn writer(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "output is closed"))
    }

    /// Length of the file on disk, after pushing out buffered bytes.
    pub async fn disk_len(&mut self) -> io::Result<u64> {
        let writer = self.writer()?;
        writer.flush().await?;
        Ok(writer.get_ref().metadata().await?.len())
    }

    /// Moves the write cursor. Fails if the file is shorter than `offset`.
    pub async fn seek(&mut self, offset: u64) -> io::Result<()> {
        let writer = self.writer()?;
        writer.flush().await?;
        let len = writer.get_ref().metadata().await?.len();
        if offset > len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("cannot seek to {offset}: file holds only {len} bytes"),
            ));
        }
        writer.get_mut().seek(SeekFrom::Start(offset)).await?;
        self.position = offset;
        Ok(())
    }

    /// Truncates or extends the file to exactly `len` bytes. The cursor is not moved.
    pub async fn set_length(&mut self, len: u64) -> io::Result<()> {
        let writer = self.writer()?;
        writer.flush().await?;
        writer.get_ref().set_len(len).await
    }

    /// Buffered write at the cursor.
    pub async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer()?.write_all(bytes).await?;
        self.position += bytes.len() as u64;
        Ok(())
    }

    /// Flushes the buffer and waits for the OS to report the data durable.
    pub async fn flush_and_sync(&mut self) -> io::Result<()> {
        let writer = self.writer()?;
        writer.flush().await?;
        writer.get_ref().sync_all().await
    }

    /// Flushes and releases the handle. Calling it again is a no-op.
    pub async fn close(&mut self) -> io::Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().await?;
            writer.into_inner().shutdown().await?;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_keeps_existing_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("part.temp");
        std::fs::write(&path, b"hello").unwrap();

        let mut output = ResumableFileOutput::open(&path, 16).await.unwrap();
        assert_eq!(output.disk_len().await.unwrap(), 5);
        output.close().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/c.temp");
        let mut output = ResumableFileOutput::open(&path, 16).await.unwrap();
        output.close().await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_seek_past_end_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut output = ResumableFileOutput::open(dir.path().join("x.temp"), 16)
            .await
            .unwrap();
        output.write(b"abc").await.unwrap();

        let err = output.seek(10).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        output.set_length(10).await.unwrap();
        output.seek(10).await.unwrap();
        assert_eq!(output.position(), 10);
    }

    #[tokio::test]
    async fn test_resume_overwrites_from_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.temp");
        let mut output = ResumableFileOutput::open(&path, 4).await.unwrap();
        output.write(b"0123456789").await.unwrap();
        output.flush_and_sync().await.unwrap();
        output.close().await.unwrap();

        let mut output = ResumableFileOutput::open(&path, 4).await.unwrap();
        output.set_length(4).await.unwrap();
        output.seek(4).await.unwrap();
        output.write(b"abcd").await.unwrap();
        output.flush_and_sync().await.unwrap();
        output.close().await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"0123abcd");
    }

    #[tokio::test]
    async fn test_sync_makes_buffer_visible() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.temp");
        let mut output = ResumableFileOutput::open(&path, 1024).await.unwrap();
        output.write(&[7u8; 100]).await.unwrap();
        output.flush_and_sync().await.unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 100);
        output.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut output = ResumableFileOutput::open(dir.path().join("c.temp"), 16)
            .await
            .unwrap();
        output.close().await.unwrap();
        output.close().await.unwrap();
        assert!(output.is_closed());
        assert!(output.write(b"late").await.is_err());
    }
}
