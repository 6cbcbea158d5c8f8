use crate::{ArtworkError, Result, Viewport};
use image::{GenericImageView, ImageFormat};
use image::imageops::FilterType;
use std::path::Path;

/// Largest size with the same aspect ratio that fits in `max_w` x `max_h`.
/// Images already inside the box keep their size.
pub fn fit_within(width: u32, height: u32, max_w: u32, max_h: u32) -> (u32, u32) {
    if width == 0 || height == 0 || (width <= max_w && height <= max_h) {
        return (width, height);
    }

    let scale = f64::min(max_w as f64 / width as f64, max_h as f64 / height as f64);
    let w = ((width as f64 * scale).round() as u32).clamp(1, max_w);
    let h = ((height as f64 * scale).round() as u32).clamp(1, max_h);
    (w, h)
}

/// Decode whatever landed at `path`, shrink it for `viewport` and rewrite it as PNG
pub fn resize_in_place(path: &Path, viewport: Viewport) -> Result<(u32, u32)> {
    let bytes = std::fs::read(path)?;
    let img = image::load_from_memory(&bytes)?;

    let (max_w, max_h) = viewport.cover_bounds();
    let (width, height) = img.dimensions();
    let (w, h) = fit_within(width, height, max_w, max_h);
    let img = if (w, h) == (width, height) {
        img
    } else {
        img.resize_exact(w, h, FilterType::Triangle)
    };

    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);

    if let Err(e) = img.save_with_format(&tmp, ImageFormat::Png) {
        let _ = std::fs::remove_file(&tmp);
        return Err(ArtworkError::Image(e));
    }
    std::fs::rename(&tmp, path)?;

    Ok((w, h))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use tempfile::TempDir;

    #[test]
    fn test_fit_within_landscape() {
        assert_eq!(fit_within(1000, 500, 320, 240), (320, 160));
    }

    #[test]
    fn test_fit_within_portrait() {
        assert_eq!(fit_within(600, 900, 320, 240), (160, 240));
    }

    #[test]
    fn test_fit_within_keeps_small_images() {
        assert_eq!(fit_within(100, 80, 320, 240), (100, 80));
        assert_eq!(fit_within(0, 80, 320, 240), (0, 80));
    }

    #[test]
    fn test_resize_jpeg_to_png() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("7.png");

        let img: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_pixel(800, 400, Rgb([200, 30, 30]));
        img.save_with_format(&path, ImageFormat::Jpeg).unwrap();

        let size = resize_in_place(&path, Viewport::new(640, 480)).unwrap();
        assert_eq!(size, (320, 160));

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(image::guess_format(&bytes).unwrap(), ImageFormat::Png);
        assert_eq!(image::image_dimensions(&path).unwrap(), (320, 160));
        assert!(!dir.path().join("7.png.tmp").exists());
    }

    #[test]
    fn test_resize_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("8.png");
        std::fs::write(&path, b"<html>not found</html>").unwrap();

        assert!(matches!(
            resize_in_place(&path, Viewport::default()),
            Err(ArtworkError::Image(_))
        ));
    }
}
