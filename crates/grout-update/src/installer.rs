//! Binary download and in-place replacement

use crate::feed::ReleaseAsset;
use crate::{Result, UpdateError};
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

pub fn sibling(exe: &Path, suffix: &str) -> PathBuf {
    let mut name = exe.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Stream `asset` to `<exe>.new`, verify it and mark it executable.
///
/// `progress` receives `(downloaded, total)`; `total` is 0 when unknown.
pub async fn download_asset(
    client: &reqwest::Client,
    asset: &ReleaseAsset,
    exe: &Path,
    mut progress: impl FnMut(u64, u64) + Send,
) -> Result<PathBuf> {
    let staged = sibling(exe, ".new");

    let response = client.get(&asset.browser_download_url).send().await?;
    if !response.status().is_success() {
        return Err(UpdateError::DownloadFailed(format!(
            "Server returned {}",
            response.status()
        )));
    }

    let total = response.content_length().unwrap_or(asset.size);
    let mut file = tokio::fs::File::create(&staged).await?;
    let mut hasher = Sha256::new();
    let mut downloaded = 0u64;
    let mut stream = response.bytes_stream();

    let written = async {
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| UpdateError::DownloadFailed(e.to_string()))?;
            file.write_all(&chunk).await?;
            hasher.update(&chunk);
            downloaded += chunk.len() as u64;
            progress(downloaded, total);
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok::<(), UpdateError>(())
    }
    .await;

    if let Err(e) = written {
        let _ = tokio::fs::remove_file(&staged).await;
        return Err(e);
    }

    if let Some(expected) = asset.sha256() {
        let actual = hex::encode(hasher.finalize());
        if actual != expected {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(UpdateError::VerificationFailed { expected, actual });
        }
        tracing::debug!("Update checksum verified");
    }

    make_executable(&staged)?;
    tracing::info!(bytes = downloaded, path = %staged.display(), "Update downloaded");
    Ok(staged)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

/// Replace `exe` with `staged`, keeping `<exe>.old` until the swap succeeds
pub fn swap_binary(exe: &Path, staged: &Path) -> Result<()> {
    let old = sibling(exe, ".old");
    if old.exists() {
        fs::remove_file(&old)?;
    }

    fs::rename(exe, &old).map_err(|e| UpdateError::InstallFailed(e.to_string()))?;

    if let Err(install) = fs::rename(staged, exe) {
        return match fs::rename(&old, exe) {
            Ok(()) => {
                tracing::warn!(error = %install, "Update swap failed, previous binary restored");
                Err(UpdateError::InstallFailed(install.to_string()))
            }
            Err(restore) => Err(UpdateError::RollbackFailed {
                install: install.to_string(),
                restore: restore.to_string(),
            }),
        };
    }

    if let Err(e) = fs::remove_file(&old) {
        tracing::warn!(path = %old.display(), error = %e, "Failed to remove previous binary");
    }
    Ok(())
}
