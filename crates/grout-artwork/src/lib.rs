//! Cover artwork for Grout
//!
//! Covers live at `<root>/.cache/artwork/<platform_slug>/<rom_id>.png`.
//! [`ArtworkPipeline::fill`] downloads the missing ones and shrinks them to
//! half the screen; [`sweep`] removes files that no longer decode.

mod fill;
mod resize;
mod sweep;

pub use fill::ArtworkPipeline;
pub use resize::{fit_within, resize_in_place};
pub use sweep::{sweep, sweep_in};

use grout_config::paths;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Parallel decode/resize limit
pub const DECODE_CONCURRENCY: usize = 4;

#[derive(Debug, Error)]
pub enum ArtworkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Processing task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, ArtworkError>;

/// Screen size in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Box a cover must fit into
    pub fn cover_bounds(&self) -> (u32, u32) {
        ((self.width / 2).max(1), (self.height / 2).max(1))
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self::new(640, 480)
    }
}

/// Outcome counts for one fill
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArtworkReport {
    pub succeeded: usize,
    pub failed: usize,
}

pub fn artwork_dir() -> PathBuf {
    paths::artwork_dir()
}

pub fn artwork_path(platform_slug: &str, rom_id: i64) -> PathBuf {
    artwork_path_in(&paths::working_dir(), platform_slug, rom_id)
}

pub fn artwork_path_in(root: &Path, platform_slug: &str, rom_id: i64) -> PathBuf {
    paths::artwork_dir_in(root)
        .join(platform_slug)
        .join(format!("{}.png", rom_id))
}

pub fn has_artwork(platform_slug: &str, rom_id: i64) -> bool {
    artwork_path(platform_slug, rom_id).is_file()
}
