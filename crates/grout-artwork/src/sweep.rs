//! Startup validation of cached covers

use grout_config::paths;
use std::path::Path;
use walkdir::WalkDir;

/// Remove unreadable PNGs under the working directory's artwork cache
pub fn sweep() -> usize {
    sweep_in(&paths::artwork_dir())
}

/// Remove every `*.png` under `dir` whose header does not decode.
/// Returns the number of files removed; other files are left alone.
pub fn sweep_in(dir: &Path) -> usize {
    if !dir.is_dir() {
        return 0;
    }

    let mut removed = 0;
    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        if !entry.file_type().is_file() || !is_png(path) {
            continue;
        }

        if let Err(e) = image::image_dimensions(path) {
            tracing::debug!(path = %path.display(), error = %e, "Removing corrupt artwork");
            match std::fs::remove_file(path) {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove corrupt artwork"),
            }
        }
    }

    if removed > 0 {
        tracing::info!(removed, "Artwork sweep removed corrupt files");
    } else {
        tracing::debug!("Artwork sweep found nothing to remove");
    }
    removed
}

fn is_png(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("png"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, ImageFormat, Rgba};
    use tempfile::TempDir;

    fn write_png(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let img: ImageBuffer<Rgba<u8>, Vec<u8>> = ImageBuffer::from_pixel(4, 4, Rgba([0, 0, 0, 255]));
        img.save_with_format(path, ImageFormat::Png).unwrap();
    }

    #[test]
    fn test_sweep_removes_only_corrupt_pngs() {
        let dir = TempDir::new().unwrap();
        let good = dir.path().join("snes").join("1.png");
        let bad = dir.path().join("snes").join("2.png");
        let other = dir.path().join("gba").join("notes.txt");

        write_png(&good);
        std::fs::write(&bad, b"truncated").unwrap();
        std::fs::create_dir_all(other.parent().unwrap()).unwrap();
        std::fs::write(&other, b"not an image").unwrap();

        assert_eq!(sweep_in(dir.path()), 1);
        assert!(good.exists());
        assert!(!bad.exists());
        assert!(other.exists());
    }

    #[test]
    fn test_sweep_is_idempotent() {
        let dir = TempDir::new().unwrap();
        write_png(&dir.path().join("psx").join("3.png"));
        std::fs::write(dir.path().join("psx").join("4.png"), b"").unwrap();

        assert_eq!(sweep_in(dir.path()), 1);
        assert_eq!(sweep_in(dir.path()), 0);
    }

    #[test]
    fn test_sweep_missing_dir() {
        let dir = TempDir::new().unwrap();
        assert_eq!(sweep_in(&dir.path().join("absent")), 0);
    }
}
