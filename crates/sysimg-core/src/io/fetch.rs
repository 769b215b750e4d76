//! Fetching remote files with streaming SHA256 verification.
//!
//! Downloads land in a temporary file next to the destination and are only
//! renamed into place once the digest matches, so readers of the
//! destination directory never observe partial content.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use sha2::{Digest, Sha256};
use sysimg_schema::Sha256Digest;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Why a download failed.
#[derive(Error, Debug)]
pub enum FetchError {
    /// The HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Writing the download failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The downloaded bytes do not match the expected digest.
    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        /// Digest that was expected.
        expected: Sha256Digest,
        /// Digest of what arrived.
        actual: Sha256Digest,
    },

    /// The download ran past its timeout.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The URL scheme is not supported.
    #[error("unsupported URL '{0}'")]
    UnsupportedUrl(String),
}

/// Abstract "fetch with checksum verification" capability.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch a small document into memory.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failures, timeouts and non-success
    /// statuses.
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError>;

    /// Fetch `url` into `dest` atomically, verifying `expected` when given.
    /// Returns the digest of what was written.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::HashMismatch`] if the content does not match,
    /// and leaves `dest` untouched on any failure.
    async fn fetch_to(
        &self,
        url: &str,
        dest: &Path,
        expected: Option<&Sha256Digest>,
    ) -> Result<Sha256Digest, FetchError>;
}

/// [`Fetcher`] over HTTP(S) with a per-request timeout.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    timeout: Duration,
}

impl HttpFetcher {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(crate::USER_AGENT)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { client, timeout })
    }

    fn check_url(url: &str) -> Result<(), FetchError> {
        if url.starts_with("http://") || url.starts_with("https://") {
            Ok(())
        } else {
            Err(FetchError::UnsupportedUrl(url.to_string()))
        }
    }

    async fn download(
        &self,
        url: &str,
        dest: &Path,
        expected: Option<&Sha256Digest>,
    ) -> Result<Sha256Digest, FetchError> {
        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(parent).await?;
        let (std_file, tmp_path) = tempfile::Builder::new()
            .prefix(".partial-")
            .tempfile_in(parent)?
            .into_parts();
        let mut file = tokio::fs::File::from_std(std_file);

        let response = self.client.get(url).send().await?.error_for_status()?;
        let mut stream = response.bytes_stream();
        let mut hasher = Sha256::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let actual = Sha256Digest::from_hasher(hasher);
        if let Some(expected) = expected.filter(|e| **e != actual) {
            // tmp_path deletes the partial file on drop.
            return Err(FetchError::HashMismatch {
                expected: expected.clone(),
                actual,
            });
        }
        tmp_path.persist(dest).map_err(|err| err.error)?;
        debug!("fetched {url} -> {}", dest.display());
        Ok(actual)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        Self::check_url(url)?;
        let request = async {
            let response = self.client.get(url).send().await?.error_for_status()?;
            Ok::<_, FetchError>(response.bytes().await?.to_vec())
        };
        tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| FetchError::Timeout(self.timeout))?
    }

    async fn fetch_to(
        &self,
        url: &str,
        dest: &Path,
        expected: Option<&Sha256Digest>,
    ) -> Result<Sha256Digest, FetchError> {
        Self::check_url(url)?;
        tokio::time::timeout(self.timeout, self.download(url, dest, expected))
            .await
            .map_err(|_| FetchError::Timeout(self.timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(Duration::from_secs(10)).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_to_verifies_and_persists() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/pool/a-1.tar.xz")
            .with_status(200)
            .with_body("hello world")
            .create_async()
            .await;

        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("pool/a-1.tar.xz");
        let expected = Sha256Digest::of_bytes(b"hello world");
        let digest = fetcher()
            .fetch_to(&format!("{}/pool/a-1.tar.xz", server.url()), &dest, Some(&expected))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(digest, expected);
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_fetch_to_rejects_mismatch_and_leaves_nothing() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/bad")
            .with_status(200)
            .with_body("corrupted")
            .create_async()
            .await;

        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("bad");
        let expected = Sha256Digest::of_bytes(b"original");
        let err = fetcher()
            .fetch_to(&format!("{}/bad", server.url()), &dest, Some(&expected))
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::HashMismatch { .. }));
        assert!(!dest.exists());
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_fetch_bytes_http_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/missing")
            .with_status(404)
            .create_async()
            .await;
        let err = fetcher()
            .fetch_bytes(&format!("{}/missing", server.url()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Http(_)));
    }

    #[tokio::test]
    async fn test_unsupported_scheme() {
        let err = fetcher().fetch_bytes("ftp://example.com/x").await.unwrap_err();
        assert!(matches!(err, FetchError::UnsupportedUrl(_)));
    }
}
