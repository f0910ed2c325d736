use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};

use super::types::{DevSpec, EnvEntry, ForwardPair};
use super::validator::validate;

/// Loads and parses the manifest file, then validates it.
pub struct ManifestLoader {
    explicit_path: Option<PathBuf>,
}

impl ManifestLoader {
    pub fn new(explicit_path: Option<&str>) -> Self {
        Self {
            explicit_path: explicit_path.map(PathBuf::from),
        }
    }

    pub fn load(&self) -> Result<DevSpec> {
        self.load_with_path().map(|(spec, _)| spec)
    }

    /// Loads the manifest and also returns the resolved path it was read
    /// from, so callers (the Activation Controller's collision check,
    /// the re-exec into `exec`) can record/pass it verbatim.
    pub fn load_with_path(&self) -> Result<(DevSpec, PathBuf)> {
        let path = self.find_manifest()?;

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read manifest: {}", path.display()))?;

        let spec: DevSpec = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse manifest: {}", path.display()))?;

        validate(&spec)?;

        Ok((spec, path))
    }

    /// Search order: explicit `-f` path, then `./devup.yml` / `./devup.yaml`
    /// in the current directory.
    fn find_manifest(&self) -> Result<PathBuf> {
        if let Some(path) = &self.explicit_path {
            let expanded = expand_home(path)?;
            if expanded.exists() {
                return Ok(expanded);
            }
            return Err(anyhow!("manifest file not found: {}", path.display()));
        }

        for candidate in ["./devup.yml", "./devup.yaml"] {
            let candidate = PathBuf::from(candidate);
            if candidate.exists() {
                return Ok(candidate);
            }
        }

        Err(anyhow!(
            "no manifest found: pass -f or create devup.yml in the current directory"
        ))
    }
}

/// Expand a single `NAME=value` manifest entry per the round-trip
/// rules: `$VAR` interpolates from process env (missing → empty), bare
/// `NAME` (no `=`) also yields an empty value.
pub fn expand_env_entry(raw: &str) -> EnvEntry {
    let (name, raw_value) = match raw.split_once('=') {
        Some((n, v)) => (n.to_string(), v.to_string()),
        None => (raw.to_string(), String::new()),
    };

    let value = if let Some(var) = raw_value.strip_prefix('$') {
        std::env::var(var).unwrap_or_default()
    } else {
        raw_value
    };

    EnvEntry { name, value }
}

pub fn expand_environment(raw: &[String]) -> Vec<EnvEntry> {
    raw.iter().map(|e| expand_env_entry(e)).collect()
}

/// Parse a `local:remote` forward pair.
pub fn parse_forward_pair(raw: &str) -> Result<ForwardPair> {
    let (local, remote) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("invalid forward pair '{}': expected local:remote", raw))?;

    let local: u16 = local
        .parse()
        .with_context(|| format!("invalid local port in '{}'", raw))?;
    let remote: u16 = remote
        .parse()
        .with_context(|| format!("invalid remote port in '{}'", raw))?;

    Ok(ForwardPair { local, remote })
}

pub fn parse_forwards(raw: &[String]) -> Result<Vec<ForwardPair>> {
    raw.iter().map(|p| parse_forward_pair(p)).collect()
}

/// Expand `~` to the user's home directory.
pub fn expand_home(path: &Path) -> Result<PathBuf> {
    let path_str = path.to_string_lossy();
    if let Some(stripped) = path_str.strip_prefix('~') {
        let home = dirs::home_dir().ok_or_else(|| anyhow!("cannot determine home directory"))?;
        let rest = stripped.strip_prefix('/').unwrap_or(stripped);
        Ok(home.join(rest))
    } else {
        Ok(path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_expansion_follows_roundtrip_rules() {
        std::env::set_var("DEVUP_TEST_FOO", "bar");

        let expanded = expand_env_entry("FOO=$DEVUP_TEST_FOO");
        assert_eq!(expanded.value, "bar");

        let missing = expand_env_entry("FOO=$DEVUP_TEST_MISSING");
        assert_eq!(missing.value, "");

        let blank = expand_env_entry("FOO=");
        assert_eq!(blank.value, "");

        let bare = expand_env_entry("FOO");
        assert_eq!(bare.value, "");

        std::env::remove_var("DEVUP_TEST_FOO");
    }

    #[test]
    fn forward_pair_parses_local_and_remote() {
        let pair = parse_forward_pair("8080:8080").unwrap();
        assert_eq!(pair.local, 8080);
        assert_eq!(pair.remote, 8080);

        assert!(parse_forward_pair("8080").is_err());
        assert!(parse_forward_pair("abc:123").is_err());
    }
}
