// SPDX-License-Identifier: MIT
//! Local fetcher facade: retrieves a single URL to disk using concurrent
//! byte-range workers, an optional bandwidth cap, and bounded retries.

use crate::errors::FetchError;
use crate::retry::{retry_with_backoff, RetryConfig};
use async_trait::async_trait;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

const OVERALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Seam the engine's Stage D programs against; tests substitute a fake.
#[async_trait]
pub trait FetcherApi: Send + Sync {
    /// Fetch `url` into `destination_directory/filename`. A no-op (success)
    /// if that file already exists — idempotence here is on filename, not
    /// checksum.
    async fn download(
        &self,
        url: &str,
        destination_directory: &Path,
        filename: &str,
    ) -> Result<(), FetchError>;
}

/// Threaded, optionally bandwidth-capped downloader.
pub struct Fetcher {
    client: Client,
    threads: usize,
    /// Bytes per second; `None` means uncapped.
    speed_limit_bytes_per_sec: Option<u64>,
    retry_cfg: RetryConfig,
}

impl Fetcher {
    pub fn new(threads: usize, speed_limit_kb: i64) -> Self {
        let client = Client::builder()
            .timeout(OVERALL_TIMEOUT)
            .build()
            .expect("building the fetcher HTTP client failed");
        let speed_limit_bytes_per_sec = if speed_limit_kb > 0 {
            Some(speed_limit_kb as u64 * 1024)
        } else {
            None
        };
        Self {
            client,
            threads: threads.max(1),
            speed_limit_bytes_per_sec,
            retry_cfg: RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_secs(30),
                max_delay: Duration::from_secs(90),
                multiplier: 2.0,
            },
        }
    }
}

#[async_trait]
impl FetcherApi for Fetcher {
    async fn download(
        &self,
        url: &str,
        destination_directory: &Path,
        filename: &str,
    ) -> Result<(), FetchError> {
        let destination = destination_directory.join(filename);
        if destination.exists() {
            info!(path = %destination.display(), "file already downloaded — skipping");
            return Ok(());
        }

        tokio::fs::create_dir_all(destination_directory).await?;

        retry_with_backoff(&self.retry_cfg, || {
            let destination = destination.clone();
            async move { self.download_once(url, &destination).await }
        })
        .await
    }
}

/// Shared byte-rate limiter: workers acquire a "token" per chunk written and
/// sleep if they have exceeded the configured rate for the current second.
struct TokenBucket {
    limit_bytes_per_sec: u64,
    consumed: tokio::sync::Mutex<(u64, std::time::Instant)>,
}

impl TokenBucket {
    fn new(limit_bytes_per_sec: u64) -> Self {
        Self {
            limit_bytes_per_sec,
            consumed: tokio::sync::Mutex::new((0, std::time::Instant::now())),
        }
    }

    async fn throttle(&self, bytes: u64) {
        let mut guard = self.consumed.lock().await;
        let (consumed, window_start) = &mut *guard;
        let elapsed = window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            *consumed = 0;
            *window_start = std::time::Instant::now();
        }
        *consumed += bytes;
        if *consumed > self.limit_bytes_per_sec {
            let overrun = *consumed - self.limit_bytes_per_sec;
            let sleep_secs = overrun as f64 / self.limit_bytes_per_sec as f64;
            tokio::time::sleep(Duration::from_secs_f64(sleep_secs.min(1.0))).await;
        }
    }
}

impl Fetcher {
    async fn download_once(&self, url: &str, destination: &Path) -> Result<(), FetchError> {
        let total_size = self.probe_content_length(url).await?;
        let tmp_path = destination.with_extension("part");

        {
            let file = tokio::fs::File::create(&tmp_path).await?;
            if total_size > 0 {
                file.set_len(total_size).await?;
            }
        }

        let bucket = self
            .speed_limit_bytes_per_sec
            .map(TokenBucket::new)
            .map(Arc::new);

        if total_size == 0 {
            self.fetch_range(url, &tmp_path, None, bucket.clone()).await?;
        } else {
            let chunk_size = total_size.div_ceil(self.threads as u64).max(1);
            let semaphore = Arc::new(Semaphore::new(self.threads));
            let mut handles = Vec::new();
            let mut start = 0u64;
            while start < total_size {
                let end = (start + chunk_size - 1).min(total_size - 1);
                let permit = semaphore.clone();
                let url = url.to_string();
                let tmp_path = tmp_path.clone();
                let client = self.client.clone();
                let bucket = bucket.clone();
                handles.push(tokio::spawn(async move {
                    let _permit = permit.acquire_owned().await.expect("semaphore closed");
                    fetch_byte_range(&client, &url, &tmp_path, start, end, bucket).await
                }));
                start = end + 1;
            }
            for handle in handles {
                handle
                    .await
                    .map_err(|e| std::io::Error::other(e.to_string()))??;
            }
        }

        tokio::fs::rename(&tmp_path, destination).await?;
        debug!(path = %destination.display(), "download complete");
        Ok(())
    }

    async fn probe_content_length(&self, url: &str) -> Result<u64, FetchError> {
        let resp = self.client.head(url).send().await?;
        Ok(resp.content_length().unwrap_or(0))
    }

    async fn fetch_range(
        &self,
        url: &str,
        tmp_path: &Path,
        range: Option<(u64, u64)>,
        bucket: Option<Arc<TokenBucket>>,
    ) -> Result<(), FetchError> {
        fetch_byte_range(&self.client, url, tmp_path, range.map_or(0, |r| r.0), range.map_or(0, |r| r.1), bucket).await
    }
}

async fn fetch_byte_range(
    client: &Client,
    url: &str,
    tmp_path: &Path,
    start: u64,
    end: u64,
    bucket: Option<Arc<TokenBucket>>,
) -> Result<(), FetchError> {
    let mut request = client.get(url);
    if end > 0 || start > 0 {
        request = request.header("Range", format!("bytes={start}-{end}"));
    }
    let resp = request.send().await?;
    let body = resp.bytes().await?;

    let mut file = tokio::fs::OpenOptions::new().write(true).open(tmp_path).await?;
    file.seek(std::io::SeekFrom::Start(start)).await?;

    const WRITE_CHUNK: usize = 64 * 1024;
    for chunk in body.chunks(WRITE_CHUNK) {
        if let Some(bucket) = &bucket {
            bucket.throttle(chunk.len() as u64).await;
        }
        file.write_all(chunk).await?;
    }
    file.flush().await?;
    Ok(())
}
