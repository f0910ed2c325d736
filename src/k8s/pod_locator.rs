//! Pod Locator: polls until exactly one running dev pod exists.
//!
//! Cancellation-aware via `tokio::select!` rather than a bare `sleep` loop,
//! and returns a typed result instead of a bool.

use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use tokio_util::sync::CancellationToken;

use crate::error::DevError;
use crate::k8s::translator::APP_LABEL;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEADLINE: Duration = Duration::from_secs(5 * 60);

/// Returns the name of the single running pod bearing `devup.dev/app=<name>`.
pub async fn get_dev_pod(
    client: kube::Client,
    namespace: &str,
    dev_name: &str,
    cancel: &CancellationToken,
) -> Result<String, DevError> {
    let pods: Api<Pod> = Api::namespaced(client, namespace);
    let selector = format!("{APP_LABEL}={dev_name}");
    let lp = ListParams::default().labels(&selector);

    let deadline = tokio::time::Instant::now() + DEADLINE;

    loop {
        if cancel.is_cancelled() {
            return Err(DevError::Cancelled);
        }

        let list = pods
            .list(&lp)
            .await
            .map_err(|e| DevError::TransientControlPlane(e.to_string()))?;

        let running: Vec<String> = list
            .items
            .into_iter()
            .filter(|p| {
                p.metadata.deletion_timestamp.is_none()
                    && p.status
                        .as_ref()
                        .and_then(|s| s.phase.as_deref())
                        == Some("Running")
            })
            .filter_map(|p| p.metadata.name)
            .collect();

        match running.len() {
            1 => return Ok(running.into_iter().next().unwrap()),
            0 => {}
            _ => return Err(DevError::AmbiguousPod(running)),
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(DevError::PodCreationTimeout(DEADLINE));
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(DevError::Cancelled),
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
}
