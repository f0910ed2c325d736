//! REST control surface for the local sync engine, plus the backoff-polling
//! helpers (`wait_for_api`-style) used to detect when it's come up.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

/// Connection details for the engine's local control surface. `folder_id`
/// is stable across restarts: it encodes `namespace+workload+container`.
#[derive(Debug, Clone)]
pub struct SyncEndpoint {
    pub gui_address: String,
    pub api_key: String,
    pub remote_data_port: u16,
    pub remote_gui_port: u16,
    pub folder_id: String,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    completion: f64,
}

/// Thin REST client against the sync engine, polling with the same
/// exponential-backoff shape used elsewhere in this crate to wait for a
/// local API to come up.
///
/// Cheaply `Clone`: `reqwest::Client` is a handle around a connection pool,
/// and `SyncEndpoint` is plain data, so handing a clone to the monitor task
/// is just a refcount bump, not a second connection.
#[derive(Clone)]
pub struct SyncRestClient {
    http: reqwest::Client,
    endpoint: SyncEndpoint,
}

impl SyncRestClient {
    pub fn new(endpoint: SyncEndpoint) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(500))
            .build()
            .context("failed to build sync engine HTTP client")?;
        Ok(Self { http, endpoint })
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.endpoint.gui_address, path)
    }

    /// Polls `/rest/system/ping` with increasing backoff until the engine
    /// answers, or `deadline` elapses.
    pub async fn wait_for_ping(&self, deadline: Duration) -> Result<()> {
        let start = std::time::Instant::now();
        let mut interval = Duration::from_millis(100);
        let max_interval = Duration::from_secs(2);

        loop {
            match self
                .http
                .get(self.url("/rest/system/ping"))
                .header("X-API-Key", &self.endpoint.api_key)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => tracing::debug!(status = %resp.status(), "sync engine ping not ready"),
                Err(e) => tracing::debug!(error = %e, "sync engine ping failed"),
            }

            if start.elapsed() >= deadline {
                return Err(anyhow!("timed out waiting for sync engine to answer"));
            }

            tokio::time::sleep(interval).await;
            interval = std::cmp::min(interval * 2, max_interval);
        }
    }

    /// Polls the folder's completion percentage until it reaches 100.
    pub async fn wait_for_completion(&self, deadline: Duration) -> Result<()> {
        let start = std::time::Instant::now();
        let mut interval = Duration::from_millis(200);
        let max_interval = Duration::from_secs(2);

        loop {
            let completion = self.completion_percent().await;
            if let Ok(pct) = completion {
                if pct >= 100.0 {
                    return Ok(());
                }
            }

            if start.elapsed() >= deadline {
                return Err(anyhow!("timed out waiting for initial sync to complete"));
            }

            tokio::time::sleep(interval).await;
            interval = std::cmp::min(interval * 2, max_interval);
        }
    }

    async fn completion_percent(&self) -> Result<f64> {
        let resp = self
            .http
            .get(self.url(&format!(
                "/rest/db/completion?folder={}",
                self.endpoint.folder_id
            )))
            .header("X-API-Key", &self.endpoint.api_key)
            .send()
            .await?
            .error_for_status()?
            .json::<CompletionResponse>()
            .await?;
        Ok(resp.completion)
    }

    /// Issues the one-shot "push local over remote" override directive.
    pub async fn override_changes(&self) -> Result<()> {
        self.http
            .post(self.url(&format!(
                "/rest/db/override?folder={}",
                self.endpoint.folder_id
            )))
            .header("X-API-Key", &self.endpoint.api_key)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Short liveness probe against the engine's REST root, used by the
    /// State Store to decide whether a persisted record is stale.
    pub async fn is_alive(&self) -> bool {
        self.http
            .get(self.url("/rest/system/ping"))
            .header("X-API-Key", &self.endpoint.api_key)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}
