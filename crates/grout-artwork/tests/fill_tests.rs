//! Artwork fill against a local HTTP server

use grout_artwork::{ArtworkPipeline, ArtworkReport, Viewport, artwork_path_in, sweep_in};
use grout_romm::mock::MockRomm;
use grout_romm::{DownloadManager, Rom};
use image::{ImageBuffer, ImageFormat, Rgb};
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn cover_jpeg() -> Vec<u8> {
    let img: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_pixel(600, 900, Rgb([10, 120, 200]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Jpeg).unwrap();
    out.into_inner()
}

/// Request path and `Authorization` header of every request served
type RequestLog = Arc<Mutex<Vec<(String, Option<String>)>>>;

async fn serve_covers() -> SocketAddr {
    serve_covers_logged().await.0
}

/// Serves `/good.jpg` as a JPEG, `/junk.png` as text, everything else 404
async fn serve_covers_logged() -> (SocketAddr, RequestLog) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let jpeg = Arc::new(cover_jpeg());
    let log: RequestLog = Arc::default();
    let requests = Arc::clone(&log);

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let jpeg = Arc::clone(&jpeg);
            let requests = Arc::clone(&requests);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let mut read = 0;
                while !buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf[read..]).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => read += n,
                    }
                }
                let request = String::from_utf8_lossy(&buf[..read]).to_string();
                let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();
                let authorization = request
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("authorization")
                            .then(|| value.trim().to_string())
                    });
                requests.lock().unwrap().push((path.clone(), authorization));

                let (status, body): (&str, Vec<u8>) = match path.as_str() {
                    "/good.jpg" => ("200 OK", jpeg.to_vec()),
                    "/junk.png" => ("200 OK", b"<html>oops</html>".to_vec()),
                    _ => ("404 Not Found", Vec::new()),
                };
                let head = format!(
                    "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    status,
                    body.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(&body).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (addr, log)
}

fn rom(id: i64, slug: &str, cover: Option<String>) -> Rom {
    Rom {
        id,
        platform_id: 1,
        platform_fs_slug: slug.to_string(),
        name: format!("Game {}", id),
        path_cover_small: cover,
        ..Default::default()
    }
}

fn pipeline(root: &TempDir) -> ArtworkPipeline {
    let downloads = DownloadManager::new(Duration::from_secs(10))
        .unwrap()
        .with_max_attempts(1);
    ArtworkPipeline::new(
        Arc::new(MockRomm::new()),
        downloads,
        root.path(),
        Viewport::new(640, 480),
    )
}

#[tokio::test]
async fn test_fill_downloads_and_resizes() {
    let addr = serve_covers().await;
    let root = TempDir::new().unwrap();
    let pipeline = pipeline(&root);

    let roms = vec![
        rom(1, "snes", Some(format!("http://{}/good.jpg", addr))),
        rom(2, "snes", Some(format!("http://{}/junk.png", addr))),
        rom(3, "snes", Some(format!("http://{}/missing.png", addr))),
        rom(4, "snes", None),
    ];

    let report = pipeline.fill(&roms).await;
    assert_eq!(report, ArtworkReport { succeeded: 1, failed: 2 });

    let good = artwork_path_in(root.path(), "snes", 1);
    assert_eq!(image::image_dimensions(&good).unwrap(), (160, 240));
    let bytes = std::fs::read(&good).unwrap();
    assert_eq!(image::guess_format(&bytes).unwrap(), ImageFormat::Png);

    assert!(!artwork_path_in(root.path(), "snes", 2).exists());
    assert!(!artwork_path_in(root.path(), "snes", 3).exists());
    assert!(!artwork_path_in(root.path(), "snes", 4).exists());

    // The stored cover survives validation
    assert_eq!(sweep_in(&root.path().join(".cache").join("artwork")), 0);
}

#[tokio::test]
async fn test_fill_skips_existing_covers() {
    let addr = serve_covers().await;
    let root = TempDir::new().unwrap();
    let pipeline = pipeline(&root);
    let roms = vec![rom(9, "gba", Some(format!("http://{}/good.jpg", addr)))];

    assert_eq!(pipeline.fill(&roms).await.succeeded, 1);
    assert!(pipeline.missing_jobs(&roms).is_empty());
    assert_eq!(pipeline.fill(&roms).await, ArtworkReport::default());
}

#[tokio::test]
async fn test_credentials_only_sent_to_romm_host() {
    let (romm_addr, romm_log) = serve_covers_logged().await;
    let (cdn_addr, cdn_log) = serve_covers_logged().await;
    let root = TempDir::new().unwrap();

    let api = MockRomm::new()
        .with_base_url(format!("http://{}", romm_addr))
        .with_auth("romm-user", "s3cret");
    let downloads = DownloadManager::new(Duration::from_secs(10))
        .unwrap()
        .with_max_attempts(1);
    let pipeline = ArtworkPipeline::new(Arc::new(api), downloads, root.path(), Viewport::new(640, 480));

    let roms = vec![
        rom(1, "snes", Some("/good.jpg".to_string())),
        rom(2, "snes", Some(format!("http://{}/good.jpg", cdn_addr))),
    ];
    let report = pipeline.fill(&roms).await;
    assert_eq!(report, ArtworkReport { succeeded: 2, failed: 0 });

    let romm_requests = romm_log.lock().unwrap().clone();
    assert_eq!(romm_requests.len(), 1);
    assert!(
        romm_requests[0]
            .1
            .as_deref()
            .is_some_and(|value| value.starts_with("Basic ")),
        "RomM host should receive basic auth"
    );

    let cdn_requests = cdn_log.lock().unwrap().clone();
    assert_eq!(cdn_requests.len(), 1);
    assert_eq!(cdn_requests[0], ("/good.jpg".to_string(), None));
}
