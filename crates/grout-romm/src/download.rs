//! Batched file downloads with retry
//!
//! Each job streams into `<destination>.partial` and is renamed into place
//! once complete. A failed attempt discards the partial file; the next
//! attempt starts over. Attempts back off exponentially and the whole job
//! is bounded by the download timeout.

use crate::classify::classify_error;
use crate::{BasicAuth, RommError};
use futures_util::StreamExt;
use futures_util::stream;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

const DEFAULT_CONCURRENCY: usize = 4;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// A single file to fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadJob {
    pub url: String,
    pub destination: PathBuf,
    pub display_name: String,
}

/// Result of one job
#[derive(Debug)]
pub struct DownloadOutcome {
    pub job: DownloadJob,
    pub result: Result<u64, RommError>,
}

impl DownloadOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Credentials and the origin they belong to
///
/// Jobs pointing anywhere else (cover CDNs, metadata providers) are fetched
/// without them.
#[derive(Debug, Clone, Copy)]
pub struct HostCredentials<'a> {
    pub origin: &'a str,
    pub auth: &'a BasicAuth,
}

impl<'a> HostCredentials<'a> {
    pub fn new(origin: &'a str, auth: &'a BasicAuth) -> Self {
        Self { origin, auth }
    }

    /// Credentials to send with a request to `url`
    pub fn for_url(&self, url: &str) -> Option<&'a BasicAuth> {
        same_origin(url, self.origin).then_some(self.auth)
    }
}

/// Whether two URLs share scheme, host and port (default ports included)
pub fn same_origin(a: &str, b: &str) -> bool {
    match (reqwest::Url::parse(a), reqwest::Url::parse(b)) {
        (Ok(a), Ok(b)) => a.origin().is_tuple() && a.origin() == b.origin(),
        _ => false,
    }
}

/// Downloads batches of files concurrently
pub struct DownloadManager {
    client: reqwest::Client,
    timeout: Duration,
    concurrency: usize,
    max_attempts: u32,
}

impl DownloadManager {
    pub fn new(timeout: Duration) -> Result<Self, RommError> {
        let client = reqwest::Client::builder()
            .user_agent(format!("Grout/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RommError::Request(e.to_string()))?;

        Ok(Self {
            client,
            timeout,
            concurrency: DEFAULT_CONCURRENCY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        })
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Download every job; outcomes come back in completion order
    pub async fn download_all(
        &self,
        jobs: Vec<DownloadJob>,
        credentials: Option<HostCredentials<'_>>,
    ) -> Vec<DownloadOutcome> {
        stream::iter(jobs)
            .map(|job| async move {
                let auth = credentials.and_then(|c| c.for_url(&job.url));
                let result = match tokio::time::timeout(self.timeout, self.download(&job, auth)).await {
                    Ok(result) => result,
                    Err(_) => {
                        let _ = tokio::fs::remove_file(partial_path(&job.destination)).await;
                        Err(RommError::Timeout)
                    }
                };

                if let Err(e) = &result {
                    tracing::warn!(name = %job.display_name, url = %job.url, error = %e, "Download failed");
                }
                DownloadOutcome { job, result }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await
    }

    async fn download(&self, job: &DownloadJob, auth: Option<&BasicAuth>) -> Result<u64, RommError> {
        if let Some(parent) = job.destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let partial = partial_path(&job.destination);
        let mut last_error = RommError::Request("no attempt made".into());

        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                tracing::debug!(name = %job.display_name, attempt = attempt + 1, "Retrying download");
                tokio::time::sleep(Duration::from_secs(2u64.pow(attempt - 1))).await;
            }

            match self.fetch_to(&job.url, &partial, auth).await {
                Ok(bytes) => {
                    tokio::fs::rename(&partial, &job.destination).await?;
                    return Ok(bytes);
                }
                Err(e) => {
                    let _ = tokio::fs::remove_file(&partial).await;
                    let retry = e.is_transient();
                    last_error = e;
                    if !retry {
                        break;
                    }
                }
            }
        }

        Err(last_error)
    }

    async fn fetch_to(&self, url: &str, path: &Path, auth: Option<&BasicAuth>) -> Result<u64, RommError> {
        let scheme = url.split_once("://").map(|(s, _)| s).unwrap_or("http");

        let mut request = self.client.get(url);
        if let Some(auth) = auth {
            request = auth.apply(request);
        }

        let response = request.send().await.map_err(|e| classify_error(scheme, &e))?;
        if !response.status().is_success() {
            return Err(RommError::from_status(response.status().as_u16()));
        }

        let mut file = tokio::fs::File::create(path).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| classify_error(scheme, &e))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(".partial");
    PathBuf::from(name)
}
