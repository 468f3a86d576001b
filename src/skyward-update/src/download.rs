//! Resumable multi-mirror downloads with an integrity gate.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use futures::StreamExt;
use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{UpdateError, UpdateResult};
use crate::verify::{self, NO_CHECKSUM, Sha256Digest};

/// Minimum window over which throughput is measured.
const THROUGHPUT_WINDOW: Duration = Duration::from_secs(2);

/// Progress information during download.
#[derive(Debug, Clone, Copy)]
pub struct DownloadProgress {
    /// Bytes on disk so far, including resumed bytes
    pub downloaded: u64,
    /// Total bytes, 0 when unknown
    pub total: u64,
    /// Bytes per second over the last full window
    pub bytes_per_second: u64,
}

impl DownloadProgress {
    /// Get download progress as a percentage (0-100).
    pub fn percentage(&self) -> f32 {
        if self.total == 0 {
            return 0.0;
        }
        (self.downloaded as f32 / self.total as f32) * 100.0
    }

    /// Get human-readable downloaded size.
    pub fn downloaded_human(&self) -> String {
        format_bytes(self.downloaded)
    }

    /// Get human-readable total size.
    pub fn total_human(&self) -> String {
        format_bytes(self.total)
    }

    pub fn rate_human(&self) -> String {
        format!("{}/s", format_bytes(self.bytes_per_second))
    }
}

/// Format bytes as human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// What to fetch and how to check it.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub mirrors: Vec<String>,
    pub destination: PathBuf,
    /// Declared size, used for resume when the server does not report one.
    pub expected_size: Option<u64>,
    /// All zero when no checksum is declared.
    pub sha256: Sha256Digest,
    pub signature: Option<Vec<u8>>,
    /// When set, a signature is mandatory.
    pub public_key: Option<[u8; 32]>,
}

impl DownloadRequest {
    pub fn new(mirrors: Vec<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            mirrors,
            destination: destination.into(),
            expected_size: None,
            sha256: NO_CHECKSUM,
            signature: None,
            public_key: None,
        }
    }
}

/// Running throughput estimate.
#[derive(Debug)]
struct Throughput {
    window_start: Instant,
    window_bytes: u64,
    rate: u64,
}

impl Throughput {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            window_bytes: 0,
            rate: 0,
        }
    }

    fn record(&mut self, bytes: u64) -> u64 {
        self.window_bytes += bytes;
        let elapsed = self.window_start.elapsed();
        if elapsed >= THROUGHPUT_WINDOW {
            self.rate = (self.window_bytes as f64 / elapsed.as_secs_f64()) as u64;
            self.window_bytes = 0;
            self.window_start = Instant::now();
        }
        self.rate
    }
}

/// A failed attempt against one mirror.
struct Attempt {
    /// The mirror produced an HTTP response.
    responded: bool,
    error: UpdateError,
}

impl Attempt {
    fn unreachable(url: &str, e: reqwest::Error) -> Self {
        Self {
            responded: false,
            error: UpdateError::MirrorFailed {
                url: url.to_string(),
                message: e.to_string(),
            },
        }
    }

    fn failed(error: UpdateError) -> Self {
        Self {
            responded: true,
            error,
        }
    }
}

/// Download manager for manifests and payloads.
#[derive(Debug, Clone)]
pub struct Downloader {
    client: Client,
    /// Same settings without any proxy, for the fallback pass.
    direct: Client,
    block_size: usize,
}

impl Downloader {
    pub fn new(config: &EngineConfig) -> UpdateResult<Self> {
        let client = skyward_common::create_download_client(config.timeout(), &config.proxy_setting())
            .map_err(|message| UpdateError::ConfigError { message })?;
        let direct = skyward_common::create_direct_client(config.timeout())
            .map_err(|message| UpdateError::ConfigError { message })?;
        Ok(Self::with_clients(client, direct, config.block_size()))
    }

    pub fn with_clients(client: Client, direct: Client, block_size: usize) -> Self {
        Self {
            client,
            direct,
            block_size: block_size.max(1),
        }
    }

    /// Fetch the artifact described by `request` and gate it.
    ///
    /// Mirrors are tried in order. If none of them produced any response the
    /// list is tried once more without a proxy. Returns the destination path
    /// only once the checksum and signature checks passed.
    pub async fn fetch<F>(
        &self,
        request: &DownloadRequest,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> UpdateResult<PathBuf>
    where
        F: FnMut(DownloadProgress),
    {
        if request.mirrors.is_empty() {
            return Err(UpdateError::NoMirrors { what: "download" });
        }
        if let Some(parent) = request.destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut last_error = None;
        let mut any_responded = false;

        for (pass, client) in [&self.client, &self.direct].into_iter().enumerate() {
            if pass == 1 {
                if any_responded {
                    break;
                }
                tracing::warn!("No mirror responded, retrying without proxy");
            }

            for url in &request.mirrors {
                match self
                    .fetch_from(client, url, request, cancel, &mut on_progress)
                    .await
                {
                    Ok(digest) => {
                        self.gate(request, &digest).await?;
                        return Ok(request.destination.clone());
                    }
                    Err(Attempt {
                        error: UpdateError::Cancelled,
                        ..
                    }) => return Err(UpdateError::Cancelled),
                    Err(attempt) => {
                        tracing::warn!("Mirror {} failed: {}", url, attempt.error);
                        any_responded |= attempt.responded;
                        last_error = Some(attempt.error);
                    }
                }
            }
        }

        Err(UpdateError::TransportExhausted {
            mirrors: request.mirrors.len(),
            last: Box::new(last_error.unwrap_or(UpdateError::NoMirrors { what: "download" })),
        })
    }

    /// Size reported by a HEAD request, if any.
    async fn remote_size(&self, client: &Client, url: &str) -> Option<u64> {
        let response = client.head(url).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        response
            .headers()
            .get(CONTENT_LENGTH)?
            .to_str()
            .ok()?
            .parse()
            .ok()
            .filter(|size| *size > 0)
    }

    /// Decide where to resume from, discarding the partial file when it
    /// cannot be trusted.
    async fn resume_offset(&self, client: &Client, url: &str, request: &DownloadRequest) -> u64 {
        let dest = &request.destination;
        let existing = match tokio::fs::metadata(dest).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => return 0,
        };
        if existing == 0 {
            return 0;
        }

        let remote = match self.remote_size(client, url).await {
            Some(size) => Some(size),
            None => request.expected_size.filter(|size| *size > 0),
        };
        match remote {
            Some(total) if existing < total => {
                tracing::debug!("Resuming {} at byte {} of {}", dest.display(), existing, total);
                existing
            }
            _ => {
                tracing::debug!("Discarding partial download {}", dest.display());
                let _ = tokio::fs::remove_file(dest).await;
                0
            }
        }
    }

    async fn fetch_from<F>(
        &self,
        client: &Client,
        url: &str,
        request: &DownloadRequest,
        cancel: &CancellationToken,
        on_progress: &mut F,
    ) -> Result<Sha256Digest, Attempt>
    where
        F: FnMut(DownloadProgress),
    {
        if cancel.is_cancelled() {
            return Err(Attempt::failed(UpdateError::Cancelled));
        }

        let dest = &request.destination;
        let mut offset = self.resume_offset(client, url, request).await;

        let response = loop {
            let mut builder = client.get(url);
            if offset > 0 {
                builder = builder.header(RANGE, format!("bytes={offset}-"));
            }
            let response = builder
                .send()
                .await
                .map_err(|e| Attempt::unreachable(url, e))?;
            let status = response.status();

            if offset > 0 && status == StatusCode::RANGE_NOT_SATISFIABLE {
                tracing::debug!("Resume rejected by {}, restarting", url);
                let _ = tokio::fs::remove_file(dest).await;
                offset = 0;
                continue;
            }
            if offset > 0 && status == StatusCode::OK {
                // Range ignored, the body is the whole artifact
                offset = 0;
            }
            if !status.is_success() {
                return Err(Attempt::failed(UpdateError::MirrorFailed {
                    url: url.to_string(),
                    message: format!("HTTP {status}"),
                }));
            }
            break response;
        };

        let total = match (
            response
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok()),
            request.expected_size,
        ) {
            (Some(len), _) => offset + len,
            (None, Some(size)) => size,
            (None, None) => 0,
        };

        let io_error = |e: std::io::Error| Attempt::failed(UpdateError::Io(e));
        let mut hasher = Sha256::new();
        let mut file = if offset > 0 {
            hash_existing(dest, &mut hasher).await.map_err(io_error)?;
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(dest)
                .await
                .map_err(io_error)?
        } else {
            tokio::fs::File::create(dest).await.map_err(io_error)?
        };

        let mut downloaded = offset;
        let mut throughput = Throughput::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                Attempt::failed(UpdateError::MirrorFailed {
                    url: url.to_string(),
                    message: e.to_string(),
                })
            })?;
            for block in chunk.chunks(self.block_size) {
                if cancel.is_cancelled() {
                    let _ = file.flush().await;
                    return Err(Attempt::failed(UpdateError::Cancelled));
                }
                file.write_all(block).await.map_err(io_error)?;
                hasher.update(block);
                downloaded += block.len() as u64;
                on_progress(DownloadProgress {
                    downloaded,
                    total,
                    bytes_per_second: throughput.record(block.len() as u64),
                });
            }
        }

        file.flush().await.map_err(io_error)?;
        file.sync_all().await.map_err(io_error)?;
        Ok(hasher.finalize().into())
    }

    /// Post-download checks, in order: checksum, signature presence,
    /// signature validity. A rejected file is deleted.
    async fn gate(&self, request: &DownloadRequest, digest: &Sha256Digest) -> UpdateResult<()> {
        let dest = &request.destination;
        let result = async {
            verify::verify_checksum(&request.sha256, digest)?;
            if let Some(key) = &request.public_key {
                let Some(signature) = &request.signature else {
                    return Err(UpdateError::SignatureMissing {
                        artifact: dest.clone(),
                    });
                };
                let on_disk = verify::sha256_file(dest).await?;
                verify::verify_signature(key, &on_disk, signature)?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = &result {
            tracing::warn!("Rejecting {}: {}", dest.display(), e);
            let _ = tokio::fs::remove_file(dest).await;
        }
        result
    }
}

async fn hash_existing(path: &Path, hasher: &mut Sha256) -> std::io::Result<()> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            return Ok(());
        }
        hasher.update(&buffer[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::sha256_bytes;
    use ed25519_dalek::{Signer, SigningKey};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const BODY: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    fn downloader() -> Downloader {
        let client = Client::builder().no_proxy().build().unwrap();
        Downloader::with_clients(client.clone(), client, 8)
    }

    async fn serve(server: &MockServer, route: &str, status: u16, body: &[u8]) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(status).set_body_bytes(body.to_vec()))
            .mount(server)
            .await;
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1024), "1.0 KB");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(1048576), "1.0 MB");
        assert_eq!(format_bytes(1073741824), "1.0 GB");
    }

    #[test]
    fn test_download_progress() {
        let progress = DownloadProgress {
            downloaded: 50_000_000,
            total: 100_000_000,
            bytes_per_second: 2048,
        };
        assert!((progress.percentage() - 50.0).abs() < 0.01);
        assert_eq!(progress.downloaded_human(), "47.7 MB");
        assert_eq!(progress.total_human(), "95.4 MB");
        assert_eq!(progress.rate_human(), "2.0 KB/s");
    }

    #[tokio::test]
    async fn test_fetch_verifies_checksum_and_reports_progress() {
        let server = MockServer::start().await;
        serve(&server, "/payload", 200, BODY).await;
        let dir = tempfile::tempdir().unwrap();

        let mut request =
            DownloadRequest::new(vec![format!("{}/payload", server.uri())], dir.path().join("p.bin"));
        request.sha256 = sha256_bytes(BODY);

        let mut updates = Vec::new();
        let path = downloader()
            .fetch(&request, &CancellationToken::new(), |p| updates.push(p.downloaded))
            .await
            .unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), BODY);
        assert_eq!(updates.last().copied(), Some(BODY.len() as u64));
        assert!(updates.len() >= BODY.len() / 8);
    }

    #[tokio::test]
    async fn test_corrupted_artifact_is_rejected_and_deleted() {
        let server = MockServer::start().await;
        let mut corrupted = BODY.to_vec();
        corrupted[5] ^= 0xFF;
        serve(&server, "/payload", 200, &corrupted).await;
        let dir = tempfile::tempdir().unwrap();

        let mut request =
            DownloadRequest::new(vec![format!("{}/payload", server.uri())], dir.path().join("p.bin"));
        request.sha256 = sha256_bytes(BODY);

        let err = downloader()
            .fetch(&request, &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::ChecksumMismatch { .. }));
        assert!(!request.destination.exists());
    }

    #[tokio::test]
    async fn test_rotates_to_next_mirror() {
        let server = MockServer::start().await;
        serve(&server, "/broken", 500, b"").await;
        serve(&server, "/good", 200, BODY).await;
        let dir = tempfile::tempdir().unwrap();

        let request = DownloadRequest::new(
            vec![format!("{}/broken", server.uri()), format!("{}/good", server.uri())],
            dir.path().join("p.bin"),
        );
        let path = downloader()
            .fetch(&request, &CancellationToken::new(), |_| {})
            .await
            .unwrap();
        assert_eq!(std::fs::read(path).unwrap(), BODY);
    }

    #[tokio::test]
    async fn test_exhausted_mirrors_keep_last_error() {
        let server = MockServer::start().await;
        serve(&server, "/a", 404, b"").await;
        serve(&server, "/b", 503, b"").await;
        let dir = tempfile::tempdir().unwrap();

        let request = DownloadRequest::new(
            vec![format!("{}/a", server.uri()), format!("{}/b", server.uri())],
            dir.path().join("p.bin"),
        );
        let err = downloader()
            .fetch(&request, &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        match err {
            UpdateError::TransportExhausted { mirrors, last } => {
                assert_eq!(mirrors, 2);
                assert!(last.to_string().contains("503"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_mirrors_are_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let request = DownloadRequest::new(
            vec!["http://127.0.0.1:9/nothing".to_string()],
            dir.path().join("p.bin"),
        );
        let err = downloader()
            .fetch(&request, &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::TransportExhausted { mirrors: 1, .. }));
    }

    #[tokio::test]
    async fn test_resumes_partial_download_with_range() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/payload"))
            .and(header("range", "bytes=10-"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(BODY[10..].to_vec()))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("p.bin");
        std::fs::write(&dest, &BODY[..10]).unwrap();

        let mut request = DownloadRequest::new(vec![format!("{}/payload", server.uri())], &dest);
        request.expected_size = Some(BODY.len() as u64);
        request.sha256 = sha256_bytes(BODY);

        let mut first = None;
        downloader()
            .fetch(&request, &CancellationToken::new(), |p| {
                first.get_or_insert(p.downloaded);
            })
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), BODY);
        assert!(first.unwrap() > 10);
    }

    #[tokio::test]
    async fn test_unreachable_proxy_falls_back_to_direct_client() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/payload"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(BODY.to_vec()))
            .expect(1)
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();

        let proxied = Client::builder()
            .proxy(reqwest::Proxy::all("http://127.0.0.1:9").unwrap())
            .build()
            .unwrap();
        let direct = Client::builder().no_proxy().build().unwrap();
        let downloader = Downloader::with_clients(proxied, direct, 8);

        let mut request =
            DownloadRequest::new(vec![format!("{}/payload", server.uri())], dir.path().join("p.bin"));
        request.sha256 = sha256_bytes(BODY);
        let path = downloader
            .fetch(&request, &CancellationToken::new(), |_| {})
            .await
            .unwrap();
        assert_eq!(std::fs::read(path).unwrap(), BODY);
    }

    #[tokio::test]
    async fn test_rejected_range_restarts_from_zero() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/payload"))
            .and(header("range", "bytes=10-"))
            .respond_with(ResponseTemplate::new(416))
            .with_priority(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/payload"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(BODY.to_vec()))
            .expect(1)
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("p.bin");
        std::fs::write(&dest, b"0123456789").unwrap();

        let mut request = DownloadRequest::new(vec![format!("{}/payload", server.uri())], &dest);
        request.expected_size = Some(BODY.len() as u64);
        request.sha256 = sha256_bytes(BODY);

        let mut first = None;
        downloader()
            .fetch(&request, &CancellationToken::new(), |p| {
                first.get_or_insert(p.downloaded);
            })
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), BODY);
        assert!(first.unwrap() <= 8);
    }

    #[tokio::test]
    async fn test_ignored_range_restarts_from_zero() {
        let server = MockServer::start().await;
        serve(&server, "/payload", 200, BODY).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("p.bin");
        std::fs::write(&dest, b"stale").unwrap();

        let mut request = DownloadRequest::new(vec![format!("{}/payload", server.uri())], &dest);
        request.expected_size = Some(BODY.len() as u64);
        request.sha256 = sha256_bytes(BODY);

        downloader()
            .fetch(&request, &CancellationToken::new(), |_| {})
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), BODY);
    }

    #[tokio::test]
    async fn test_partial_without_known_size_is_discarded() {
        let server = MockServer::start().await;
        serve(&server, "/payload", 200, BODY).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("p.bin");
        std::fs::write(&dest, b"garbage-prefix").unwrap();

        let request = DownloadRequest::new(vec![format!("{}/payload", server.uri())], &dest);
        downloader()
            .fetch(&request, &CancellationToken::new(), |_| {})
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), BODY);
    }

    #[tokio::test]
    async fn test_signature_gate() {
        let server = MockServer::start().await;
        serve(&server, "/payload", 200, BODY).await;
        let dir = tempfile::tempdir().unwrap();
        let signing = SigningKey::from_bytes(&[5u8; 32]);

        let mut request =
            DownloadRequest::new(vec![format!("{}/payload", server.uri())], dir.path().join("p.bin"));
        request.public_key = Some(signing.verifying_key().to_bytes());

        let err = downloader()
            .fetch(&request, &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::SignatureMissing { .. }));
        assert!(!request.destination.exists());

        request.signature = Some(signing.sign(&sha256_bytes(b"something else")).to_bytes().to_vec());
        let err = downloader()
            .fetch(&request, &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::SignatureInvalid { .. }));
        assert!(!request.destination.exists());

        request.signature = Some(signing.sign(&sha256_bytes(BODY)).to_bytes().to_vec());
        downloader()
            .fetch(&request, &CancellationToken::new(), |_| {})
            .await
            .unwrap();
        assert!(request.destination.exists());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let server = MockServer::start().await;
        serve(&server, "/payload", 200, BODY).await;
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let request =
            DownloadRequest::new(vec![format!("{}/payload", server.uri())], dir.path().join("p.bin"));
        let err = downloader().fetch(&request, &cancel, |_| {}).await.unwrap_err();
        assert!(matches!(err, UpdateError::Cancelled));
    }
}
