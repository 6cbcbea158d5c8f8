//! On-demand cover download

use crate::resize::resize_in_place;
use crate::{ArtworkError, ArtworkReport, DECODE_CONCURRENCY, Viewport, artwork_path_in};
use futures_util::StreamExt;
use futures_util::stream;
use grout_romm::{DownloadJob, DownloadManager, HostCredentials, Rom, RommApi};
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

/// Downloads and normalises covers for a list of ROMs
pub struct ArtworkPipeline {
    api: Arc<dyn RommApi>,
    downloads: DownloadManager,
    root: PathBuf,
    viewport: Viewport,
}

impl ArtworkPipeline {
    pub fn new(api: Arc<dyn RommApi>, downloads: DownloadManager, root: impl Into<PathBuf>, viewport: Viewport) -> Self {
        Self {
            api,
            downloads,
            root: root.into(),
            viewport,
        }
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
    }

    /// Download jobs for ROMs that have a cover on the server but not on disk
    pub fn missing_jobs(&self, roms: &[Rom]) -> Vec<DownloadJob> {
        let mut seen = HashSet::new();
        roms.iter()
            .filter_map(|rom| {
                let cover = rom.cover_path()?;
                let slug = platform_slug(rom)?;
                let destination = artwork_path_in(&self.root, slug, rom.id);
                if destination.is_file() || !seen.insert(destination.clone()) {
                    return None;
                }
                Some(DownloadJob {
                    url: resolve_url(self.api.base_url(), cover),
                    destination,
                    display_name: rom.name.clone(),
                })
            })
            .collect()
    }

    /// Fetch and resize every missing cover
    pub async fn fill(&self, roms: &[Rom]) -> ArtworkReport {
        let jobs = self.missing_jobs(roms);
        if jobs.is_empty() {
            return ArtworkReport::default();
        }

        for job in &jobs {
            if let Some(parent) = job.destination.parent() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    tracing::warn!(path = %parent.display(), error = %e, "Failed to create artwork directory");
                }
            }
        }

        let total = jobs.len();
        let auth = self.api.auth();
        let credentials = auth
            .as_ref()
            .map(|auth| HostCredentials::new(self.api.base_url(), auth));
        let outcomes = self.downloads.download_all(jobs, credentials).await;

        let mut report = ArtworkReport::default();
        let downloaded: Vec<PathBuf> = outcomes
            .into_iter()
            .filter_map(|outcome| match outcome.result {
                Ok(_) => Some(outcome.job.destination),
                Err(_) => {
                    report.failed += 1;
                    None
                }
            })
            .collect();

        let viewport = self.viewport;
        let results: Vec<bool> = stream::iter(downloaded)
            .map(|path| async move { process(path, viewport).await })
            .buffer_unordered(DECODE_CONCURRENCY)
            .collect()
            .await;

        for ok in results {
            if ok {
                report.succeeded += 1;
            } else {
                report.failed += 1;
            }
        }

        tracing::info!(total, succeeded = report.succeeded, failed = report.failed, "Artwork fill finished");
        report
    }
}

async fn process(path: PathBuf, viewport: Viewport) -> bool {
    let target = path.clone();
    let result = tokio::task::spawn_blocking(move || {
        std::panic::catch_unwind(AssertUnwindSafe(|| resize_in_place(&target, viewport)))
            .unwrap_or_else(|_| Err(ArtworkError::Task("image processing panicked".into())))
    })
    .await
    .unwrap_or_else(|e| Err(ArtworkError::Task(e.to_string())));

    match result {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Discarding undecodable artwork");
            let _ = tokio::fs::remove_file(&path).await;
            false
        }
    }
}

fn platform_slug(rom: &Rom) -> Option<&str> {
    [rom.platform_fs_slug.as_str(), rom.platform_slug.as_str()]
        .into_iter()
        .find(|s| !s.is_empty())
}

/// Absolute cover URL; server-relative paths are joined onto `base_url`
fn resolve_url(base_url: &str, cover: &str) -> String {
    if cover.starts_with("http://") || cover.starts_with("https://") {
        return cover.to_string();
    }
    format!("{}/{}", base_url.trim_end_matches('/'), cover.trim_start_matches('/'))
}
