//! State Store: a local, per-user persistent index of active
//! dev environments, one YAML file per record under
//! `<config>/state/<namespace>/<workload>/<container>`.
//!
//! Insert is atomic (write-temp + rename), the same pattern used for every
//! other on-disk write in this crate, generalized here to a whole directory
//! tree of records instead of one file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::DevError;

/// One active dev environment, persisted locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationRecord {
    pub namespace: String,
    pub workload: String,
    pub container: String,
    pub local_sync_address: String,
    pub pod: String,
    pub manifest_path: String,
    pub source_folder: String,
    pub started_at: String,
}

impl ActivationRecord {
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.namespace, self.workload, self.container)
    }
}

pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: config_dir.into().join("state"),
        }
    }

    fn path_for_key(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Lists every persisted record. Malformed files are skipped rather
    /// than failing the whole listing; a record is only ever written by
    /// this module, so a parse failure means external tampering or a
    /// half-written file from a crashed process, neither of which should
    /// block every other command.
    ///
    /// Also prunes stale records as it enumerates: any record whose engine
    /// no longer answers a liveness probe is removed before the list is
    /// returned, so every caller of `all` gets cleanup for free instead of
    /// having to remember to probe separately.
    pub async fn all(&self) -> Result<Vec<ActivationRecord>> {
        let mut records = Vec::new();
        collect_records(&self.root, &mut records).await?;

        let mut live = Vec::with_capacity(records.len());
        for record in records {
            if !self.remove_if_stale(&record).await? {
                live.push(record);
            }
        }
        Ok(live)
    }

    /// Atomically inserts `record` at `key`. If a live (non-stale) record
    /// already exists at that key, returns `AlreadyRunning` and leaves the
    /// existing record untouched.
    pub async fn insert(&self, key: &str, record: &ActivationRecord) -> Result<(), DevError> {
        let path = self.path_for_key(key);

        if path.exists() {
            if let Ok(existing) = read_record(&path).await {
                if !probe_stale(&existing).await {
                    return Err(DevError::AlreadyRunning(key.to_string()));
                }
            }
        }

        let parent = path.parent().expect("record path always has a parent");
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DevError::MalformedDevState(key.to_string(), e.to_string()))?;

        let yaml = serde_yaml::to_string(record)
            .map_err(|e| DevError::MalformedDevState(key.to_string(), e.to_string()))?;

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, yaml)
            .await
            .map_err(|e| DevError::MalformedDevState(key.to_string(), e.to_string()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| DevError::MalformedDevState(key.to_string(), e.to_string()))?;

        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for_key(key);
        if path.exists() {
            tokio::fs::remove_file(&path)
                .await
                .with_context(|| format!("failed to remove state record {}", path.display()))?;
        }
        Ok(())
    }

    /// Removes `record` if its sync engine no longer answers a liveness
    /// probe. Returns whether it was removed.
    pub async fn remove_if_stale(&self, record: &ActivationRecord) -> Result<bool> {
        if probe_stale(record).await {
            self.delete(&record.key()).await?;
            return Ok(true);
        }
        Ok(false)
    }
}

async fn probe_stale(record: &ActivationRecord) -> bool {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_millis(500))
        .build()
    {
        Ok(c) => c,
        Err(_) => return true,
    };

    let url = format!("http://{}/rest/system/ping", record.local_sync_address);
    match client.get(&url).send().await {
        Ok(resp) => !resp.status().is_success(),
        Err(_) => true,
    }
}

async fn read_record(path: &Path) -> Result<ActivationRecord> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(serde_yaml::from_str(&content)?)
}

fn collect_records<'a>(
    dir: &'a Path,
    out: &'a mut Vec<ActivationRecord>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + 'a>> {
    Box::pin(async move {
        if !dir.exists() {
            return Ok(());
        }

        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_dir() {
                collect_records(&path, out).await?;
            } else if path.extension().and_then(|e| e.to_str()) != Some("tmp") {
                if let Ok(record) = read_record(&path).await {
                    out.push(record);
                }
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(ns: &str, local_sync_address: String) -> ActivationRecord {
        ActivationRecord {
            namespace: ns.to_string(),
            workload: "api".to_string(),
            container: "app".to_string(),
            local_sync_address,
            pod: "api-abc123".to_string(),
            manifest_path: "./devup.yml".to_string(),
            source_folder: "/home/dev/api".to_string(),
            started_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    /// Answers every connection with a 200 so `probe_stale` reads the
    /// record as live. Nothing is listening on port 1 in the real sync
    /// engine case this stands in for.
    async fn spawn_fake_ping_server() -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}")
                    .await;
            }
        });

        addr.to_string()
    }

    #[tokio::test]
    async fn insert_then_all_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let record = sample_record("default", spawn_fake_ping_server().await);

        store.insert(&record.key(), &record).await.unwrap();
        let all = store.all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].pod, record.pod);
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_live_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let record = sample_record("default", spawn_fake_ping_server().await);

        store.insert(&record.key(), &record).await.unwrap();
        let second = store.insert(&record.key(), &record).await;
        assert!(matches!(second, Err(DevError::AlreadyRunning(_))));
    }

    #[tokio::test]
    async fn all_prunes_a_stale_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        // Nothing is listening on this port, so the liveness probe fails
        // and the record counts as stale.
        let record = sample_record("default", "127.0.0.1:1".to_string());
        store.insert(&record.key(), &record).await.unwrap();

        let all = store.all().await.unwrap();
        assert!(all.is_empty());

        let path = dir.path().join("state").join(record.key());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn delete_removes_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let record = sample_record("default", spawn_fake_ping_server().await);

        store.insert(&record.key(), &record).await.unwrap();
        store.delete(&record.key()).await.unwrap();
        let all = store.all().await.unwrap();
        assert!(all.is_empty());
    }
}
