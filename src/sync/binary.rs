//! Ensures the local sync engine binary is present, fetching it on first
//! use. The engine itself is an external binary whose internals are out of
//! scope here; this module only manages the local copy.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;

use crate::error::DevError;

/// Where the binary lives and which version is expected, read from
/// `RuntimeConfig`.
pub struct BinarySpec {
    pub install_dir: PathBuf,
    pub version: String,
    pub download_base_url: String,
}

fn binary_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "devup-sync.exe"
    } else {
        "devup-sync"
    }
}

/// Returns the path to a runnable sync engine binary, fetching it into
/// `install_dir` first if it isn't there yet.
pub async fn ensure_binary(spec: &BinarySpec) -> Result<PathBuf, DevError> {
    let path = spec.install_dir.join(binary_name());

    if path.exists() {
        return Ok(path);
    }

    tokio::fs::create_dir_all(&spec.install_dir)
        .await
        .map_err(|e| DevError::LocalDependencyMissing(e.to_string()))?;

    fetch_binary(spec, &path)
        .await
        .map_err(|e| DevError::LocalDependencyMissing(e.to_string()))?;

    make_executable(&path)
        .map_err(|e| DevError::LocalDependencyMissing(e.to_string()))?;

    Ok(path)
}

async fn fetch_binary(spec: &BinarySpec, dest: &Path) -> Result<()> {
    let url = format!(
        "{}/v{}/{}-{}",
        spec.download_base_url,
        spec.version,
        binary_name(),
        std::env::consts::ARCH,
    );

    let client = reqwest::Client::new();
    let resp = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("failed to download sync engine from {url}"))?
        .error_for_status()
        .with_context(|| format!("sync engine download returned an error status: {url}"))?;

    let bytes = resp
        .bytes()
        .await
        .context("failed to read sync engine download body")?;

    let tmp = dest.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp)
        .await
        .with_context(|| format!("failed to create {}", tmp.display()))?;
    file.write_all(&bytes).await?;
    file.flush().await?;
    drop(file);

    tokio::fs::rename(&tmp, dest)
        .await
        .with_context(|| format!("failed to install sync engine at {}", dest.display()))?;

    Ok(())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}
