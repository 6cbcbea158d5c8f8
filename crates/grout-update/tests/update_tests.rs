//! End-to-end update flow against a local release feed

use grout_config::{Cfw, ReleaseChannel};
use grout_update::{ReleaseFeed, UpdateError, Updater, sibling};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const NEW_BINARY: &[u8] = b"#!/bin/sh\necho grout 1.3.0\n";

/// Binds first so the feed can point its asset URL back at this server
async fn feed_with(digest: &str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let feed = format!(
        r#"[
            {{"tag_name": "v1.4.0-beta.1", "prerelease": true, "assets": []}},
            {{"tag_name": "v1.3.0", "prerelease": false, "assets": [
                {{"name": "grout-muos", "browser_download_url": "http://{addr}/grout-muos",
                  "size": {size}, "digest": "{digest}"}}
            ]}},
            {{"tag_name": "v1.2.0", "prerelease": false, "assets": []}}
        ]"#,
        size = NEW_BINARY.len(),
    );

    let mut routes = HashMap::new();
    routes.insert("/releases".to_string(), feed.into_bytes());
    routes.insert("/grout-muos".to_string(), NEW_BINARY.to_vec());
    spawn_routes(listener, routes);

    format!("http://{}/releases", addr)
}

/// Serves fixed bodies by path; anything else is a 404
fn spawn_routes(listener: TcpListener, routes: HashMap<String, Vec<u8>>) {
    let routes = Arc::new(routes);
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let routes = Arc::clone(&routes);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let mut read = 0;
                while !buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf[read..]).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => read += n,
                    }
                }
                let request = String::from_utf8_lossy(&buf[..read]).to_string();
                let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();

                let (status, body) = match routes.get(&path) {
                    Some(body) => ("200 OK", body.clone()),
                    None => ("404 Not Found", Vec::new()),
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
}

fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

fn updater(feed_url: &str, exe: &std::path::Path, channel: ReleaseChannel) -> Updater {
    Updater::new(ReleaseFeed::new(feed_url).unwrap(), Cfw::MuOS, channel, exe)
}

#[tokio::test]
async fn test_check_and_apply_update() {
    let feed_url = feed_with(&sha256_digest(NEW_BINARY)).await;
    let dir = TempDir::new().unwrap();
    let exe = dir.path().join("grout");
    std::fs::write(&exe, b"old build").unwrap();

    let updater = updater(&feed_url, &exe, ReleaseChannel::Stable);
    let update = updater.check("v1.2.0", None).await.unwrap().unwrap();
    assert_eq!(update.latest_version, "v1.3.0");
    assert_eq!(update.asset.name, "grout-muos");

    let mut seen = Vec::new();
    updater
        .apply(&update, |done, total| seen.push((done, total)))
        .await
        .unwrap();

    assert_eq!(std::fs::read(&exe).unwrap(), NEW_BINARY);
    assert!(!sibling(&exe, ".new").exists());
    assert!(!sibling(&exe, ".old").exists());
    assert_eq!(seen.last().copied(), Some((NEW_BINARY.len() as u64, NEW_BINARY.len() as u64)));

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&exe).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}

#[tokio::test]
async fn test_up_to_date_reports_nothing() {
    let feed_url = feed_with(&sha256_digest(NEW_BINARY)).await;
    let dir = TempDir::new().unwrap();
    let updater = updater(&feed_url, &dir.path().join("grout"), ReleaseChannel::Stable);

    assert_eq!(updater.check("v1.3.0", None).await.unwrap(), None);
    assert_eq!(updater.check("dev", None).await.unwrap(), None);
}

#[tokio::test]
async fn test_beta_channel_without_asset_errors() {
    let feed_url = feed_with(&sha256_digest(NEW_BINARY)).await;
    let dir = TempDir::new().unwrap();
    let updater = updater(&feed_url, &dir.path().join("grout"), ReleaseChannel::Beta);

    let err = updater.check("v1.3.0", None).await.unwrap_err();
    assert!(matches!(err, UpdateError::NoAsset { ref release, .. } if release == "v1.4.0-beta.1"));
    assert!(!updater.is_checking());
}

#[tokio::test]
async fn test_checksum_mismatch_keeps_current_binary() {
    let feed_url = feed_with(&sha256_digest(b"something else")).await;
    let dir = TempDir::new().unwrap();
    let exe = dir.path().join("grout");
    std::fs::write(&exe, b"old build").unwrap();

    let updater = updater(&feed_url, &exe, ReleaseChannel::MatchRomm);
    let update = updater.check("1.2.0", Some("4.1.0")).await.unwrap().unwrap();
    let err = updater.apply(&update, |_, _| {}).await.unwrap_err();

    assert!(matches!(err, UpdateError::VerificationFailed { .. }));
    assert_eq!(std::fs::read(&exe).unwrap(), b"old build");
    assert!(!sibling(&exe, ".new").exists());
}
