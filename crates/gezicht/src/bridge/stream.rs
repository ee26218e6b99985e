//! One-shot unix socket endpoint for bulk byte transfer to a worker.
//!
//! Path format: `{temp_dir}/gezicht_stream_{uuid}`. The worker connects once,
//! reads until EOF, and the endpoint is gone.

use std::io;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::net::UnixListener;

pub const STREAM_PREFIX: &str = "gezicht_stream";

pub struct StreamEndpoint {
    path: PathBuf,
    listener: UnixListener,
}

impl StreamEndpoint {
    /// Bind a fresh endpoint under the system temp dir.
    pub fn bind(prefix: &str) -> io::Result<Self> {
        let name = format!("{}_{}", prefix, uuid::Uuid::new_v4().simple());
        Self::bind_at(std::env::temp_dir().join(name))
    }

    pub fn bind_at(path: PathBuf) -> io::Result<Self> {
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        tracing::trace!(path = %path.display(), "Bound stream endpoint");
        Ok(Self { path, listener })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept one connection, copy `source` into it, then shut it down.
    ///
    /// Returns the number of bytes transferred. The socket file is removed
    /// when this returns.
    pub async fn serve<R>(self, mut source: R) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let (mut conn, _) = self.listener.accept().await?;
        tracing::trace!(path = %self.path.display(), "Worker connected to stream endpoint");
        let copied = tokio::io::copy(&mut source, &mut conn).await?;
        conn.shutdown().await?;
        tracing::debug!(path = %self.path.display(), bytes = copied, "Stream transfer complete");
        Ok(copied)
    }
}

impl Drop for StreamEndpoint {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(error = %e, path = %self.path.display(), "Failed to remove stream endpoint");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixStream;

    #[tokio::test]
    async fn paths_are_unique_and_prefixed() {
        let a = StreamEndpoint::bind(STREAM_PREFIX).unwrap();
        let b = StreamEndpoint::bind(STREAM_PREFIX).unwrap();
        assert_ne!(a.path(), b.path());

        let name = a.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("gezicht_stream_"));
        assert!(a.path().starts_with(std::env::temp_dir()));
    }

    #[tokio::test]
    async fn transfers_bytes_then_eof() {
        let endpoint = StreamEndpoint::bind(STREAM_PREFIX).unwrap();
        let path = endpoint.path().to_path_buf();
        let payload: Vec<u8> = (0..=255u8).cycle().take(200_000).collect();

        let expected = payload.clone();
        let server = tokio::spawn(endpoint.serve(std::io::Cursor::new(payload)));

        let mut client = UnixStream::connect(&path).await.unwrap();
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();

        assert_eq!(server.await.unwrap().unwrap(), expected.len() as u64);
        assert_eq!(received, expected);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn drop_removes_socket_file() {
        let endpoint = StreamEndpoint::bind(STREAM_PREFIX).unwrap();
        let path = endpoint.path().to_path_buf();
        assert!(path.exists());

        drop(endpoint);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn bind_at_replaces_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale");
        std::fs::write(&path, b"left over").unwrap();

        let endpoint = StreamEndpoint::bind_at(path.clone()).unwrap();
        assert_eq!(endpoint.path(), path);
    }
}
