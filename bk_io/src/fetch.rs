//! Verified artifact fetching.
//!
//! Every transfer streams through [`BlobWriter`], so an artifact reaches the
//! cache only after its SHA-256 matched. Network errors and digest
//! mismatches are retried with exponential backoff; the cache makes a second
//! fetch of the same checksum free.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use bk_core::Error;

use crate::blob::{BlobCache, BlobWriter};
use crate::config::RetryPolicy;
use crate::traits::HttpClient;

/// A single artifact to fetch and verify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub sha256: String,
    /// Used in progress events and error messages
    pub name: String,
}

#[derive(Clone)]
pub struct Fetcher {
    client: Arc<dyn HttpClient>,
    cache: BlobCache,
    retry: RetryPolicy,
    semaphore: Arc<Semaphore>,
}

impl Fetcher {
    pub fn new(
        client: Arc<dyn HttpClient>,
        cache: BlobCache,
        retry: RetryPolicy,
        concurrency: usize,
    ) -> Self {
        Self {
            client,
            cache,
            retry,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    pub fn cache(&self) -> &BlobCache {
        &self.cache
    }

    /// Fetch and verify, returning the cached blob path.
    pub async fn fetch(&self, request: &FetchRequest) -> Result<PathBuf, Error> {
        if self.cache.has_blob(&request.sha256) {
            debug!(name = %request.name, sha256 = %request.sha256, "artifact already cached");
            return Ok(self.cache.blob_path(&request.sha256));
        }

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| Error::NetworkFailure {
                message: "fetcher shut down".to_string(),
            })?;

        let mut attempt = 0;
        loop {
            match self.fetch_once(request).await {
                Ok(path) => return Ok(path),
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        name = %request.name,
                        url = %request.url,
                        attempt,
                        max_retries = self.retry.max_retries,
                        ?delay,
                        error = %e,
                        "fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_once(&self, request: &FetchRequest) -> Result<PathBuf, Error> {
        let mut writer = self
            .cache
            .start_write(&request.sha256)
            .map_err(|e| Error::fs(self.cache.blob_path(&request.sha256).as_path(), e))?;
        let file_name = file_name_of(&request.url);

        if let Some(local) = request.url.strip_prefix("file://") {
            let local = PathBuf::from(local);
            let writer = tokio::task::spawn_blocking(move || copy_local(&local, writer))
                .await
                .map_err(|e| Error::NetworkFailure {
                    message: format!("copy task failed: {e}"),
                })??;
            return writer.commit(file_name.as_deref());
        }

        let mut stream = self.client.get_stream(&request.url).await?;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            writer.write_all(&chunk).map_err(|e| Error::NetworkFailure {
                message: format!("failed to write {}: {e}", request.name),
            })?;
        }
        writer.commit(file_name.as_deref())
    }
}

fn copy_local(path: &Path, mut writer: BlobWriter) -> Result<BlobWriter, Error> {
    let mut file = std::fs::File::open(path).map_err(|e| Error::NetworkFailure {
        message: format!("cannot read {}: {e}", path.display()),
    })?;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(|e| Error::fs(path, e))?;
        if n == 0 {
            return Ok(writer);
        }
        writer.write_all(&buf[..n]).map_err(|e| Error::fs(path, e))?;
    }
}

fn file_name_of(url: &str) -> Option<String> {
    url.rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::sha256_hex;
    use crate::traits::{ByteStream, MockHttpClient, ReqwestHttpClient};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: 5,
        }
    }

    fn fetcher(tmp: &TempDir, client: Arc<dyn HttpClient>, retries: u32) -> Fetcher {
        let cache = BlobCache::new(&tmp.path().join("cache")).unwrap();
        Fetcher::new(client, cache, fast_retry(retries), 4)
    }

    fn request(url: String, body: &[u8]) -> FetchRequest {
        FetchRequest {
            url,
            sha256: sha256_hex(body),
            name: "foo".to_string(),
        }
    }

    #[tokio::test]
    async fn fetches_and_caches_verified_blob() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/foo.tar.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"bottle bytes".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let fetcher = fetcher(&tmp, Arc::new(ReqwestHttpClient::new()), 0);
        let req = request(format!("{}/foo.tar.gz", server.uri()), b"bottle bytes");

        let first = fetcher.fetch(&req).await.unwrap();
        let second = fetcher.fetch(&req).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(std::fs::read(&first).unwrap(), b"bottle bytes");
    }

    #[tokio::test]
    async fn tampered_download_is_rejected_after_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/foo.tar.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"evil".to_vec()))
            .expect(3)
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let fetcher = fetcher(&tmp, Arc::new(ReqwestHttpClient::new()), 2);
        let req = request(format!("{}/foo.tar.gz", server.uri()), b"genuine");

        let err = fetcher.fetch(&req).await.unwrap_err();
        assert!(matches!(
            err,
            Error::ChecksumMismatch { ref file_name, .. } if file_name.as_deref() == Some("foo.tar.gz")
        ));
        assert!(!fetcher.cache().has_blob(&req.sha256));
    }

    #[tokio::test]
    async fn server_errors_surface_as_network_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let fetcher = fetcher(&tmp, Arc::new(ReqwestHttpClient::new()), 1);
        let req = request(format!("{}/foo.tar.gz", server.uri()), b"x");

        let err = fetcher.fetch(&req).await.unwrap_err();
        assert!(matches!(err, Error::NetworkFailure { ref message } if message.contains("500")));
    }

    #[tokio::test]
    async fn transient_failure_recovers_on_retry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut client = MockHttpClient::new();
        client.expect_get_stream().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::NetworkFailure {
                    message: "connection reset".to_string(),
                })
            } else {
                Ok(Box::pin(futures::stream::iter(vec![Ok(b"payload".to_vec())])) as ByteStream)
            }
        });

        let tmp = TempDir::new().unwrap();
        let fetcher = fetcher(&tmp, Arc::new(client), 3);
        let req = request("https://example.com/foo.tar.gz".to_string(), b"payload");

        let blob = fetcher.fetch(&req).await.unwrap();
        assert_eq!(std::fs::read(blob).unwrap(), b"payload");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_errors_stop_immediately() {
        let mut client = MockHttpClient::new();
        client.expect_get_stream().times(1).returning(|_| {
            Err(Error::Config {
                message: "bad url".to_string(),
            })
        });

        let tmp = TempDir::new().unwrap();
        let fetcher = fetcher(&tmp, Arc::new(client), 5);
        let req = request("https://example.com/foo.tar.gz".to_string(), b"x");

        assert!(matches!(fetcher.fetch(&req).await, Err(Error::Config { .. })));
    }

    #[tokio::test]
    async fn file_urls_are_read_locally() {
        let tmp = TempDir::new().unwrap();
        let mirror = tmp.path().join("mirror.tar.gz");
        std::fs::write(&mirror, b"local bytes").unwrap();

        let mut client = MockHttpClient::new();
        client.expect_get_stream().never();
        let fetcher = fetcher(&tmp, Arc::new(client), 0);
        let req = request(format!("file://{}", mirror.display()), b"local bytes");

        let blob = fetcher.fetch(&req).await.unwrap();
        assert_eq!(std::fs::read(blob).unwrap(), b"local bytes");
    }

    #[test]
    fn file_name_is_last_url_segment() {
        assert_eq!(
            file_name_of("https://ghcr.io/v2/core/foo/blobs/sha256:abc").as_deref(),
            Some("sha256:abc")
        );
        assert_eq!(file_name_of("https://example.com/"), None);
    }
}
