//! Activation Controller: the top-level state machine composing the
//! Workload Translator, Pod Locator, Sync Supervisor, Forward Supervisor and
//! Session Runner.
//!
//! A supervisor-tree, not shared mutable state: this struct owns a
//! `CancellationToken` and its children communicate back via one-shot or
//! mpsc channels, never through shared fields. Re-executing the current
//! binary for the interactive session is a deliberate process-isolation
//! choice, not an accident: the session can be torn down by killing the
//! child without touching the supervisor's own state.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, Patch, PatchParams, PostParams};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::DevError;
use crate::k8s::forward::{ForwardEvent, ForwardSupervisor};
use crate::k8s::pod_locator::get_dev_pod;
use crate::k8s::secret::ensure_sync_secret;
use crate::k8s::translator::{translate, SNAPSHOT_ANNOTATION};
use crate::manifest::{parse_forwards, DevSpec, TargetWorkload};
use crate::runtime::RuntimeConfig;
use crate::store::{ActivationRecord, StateStore};
use crate::sync::binary::BinarySpec;
use crate::sync::{SyncMode, SyncSupervisor};

const SYNC_DATA_PORT: u16 = 22000;
const SYNC_GUI_PORT: u16 = 8384;

/// Owns the Sync Supervisor and Forward Supervisor for the duration of one
/// invocation.
pub struct ActivationController {
    client: kube::Client,
    target: TargetWorkload,
    dev: DevSpec,
    manifest_path: String,
    config_home: PathBuf,
    runtime: RuntimeConfig,
    /// Cancelled only by an OS interrupt (wired up in `main`). Survives
    /// across reconnect attempts.
    parent_cancel: CancellationToken,
    /// Child of `parent_cancel`, scoped to a single activation attempt.
    /// `shutdown` cancels this one so the next attempt after a reconnect
    /// gets a live context instead of inheriting a permanently-cancelled
    /// token.
    cancel: CancellationToken,
    store: StateStore,
    forward: Option<ForwardSupervisor>,
    sync: Option<SyncSupervisor>,
}

impl ActivationController {
    pub fn new(
        client: kube::Client,
        target: TargetWorkload,
        dev: DevSpec,
        manifest_path: String,
        config_home: PathBuf,
        runtime: RuntimeConfig,
    ) -> Self {
        let parent_cancel = CancellationToken::new();
        let cancel = parent_cancel.child_token();
        Self {
            client,
            target,
            dev,
            manifest_path,
            config_home,
            runtime,
            parent_cancel,
            cancel,
            store: StateStore::new(PathBuf::new()),
            forward: None,
            sync: None,
        }
        .with_store()
    }

    fn with_store(mut self) -> Self {
        self.store = StateStore::new(self.config_home.clone());
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.parent_cancel.clone()
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.target.namespace)
    }

    fn folder_id(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.target.namespace.as_bytes());
        hasher.update(self.target.name.as_bytes());
        hasher.update(self.target.container.as_deref().unwrap_or("").as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Runs the activation loop: `Execute`, then reconnect on sync
    /// disconnect until the interactive session exits cleanly or the
    /// invocation is cancelled.
    pub async fn run(&mut self) -> Result<(), DevError> {
        let mut is_retry = false;

        let outcome = loop {
            match self.execute(is_retry).await {
                Ok(()) => break Ok(()),
                Err(e) if e.is_reconnectable() => {
                    warn!(error = %e, "sync connection lost; reconnecting");
                    self.shutdown().await;
                    is_retry = true;
                    continue;
                }
                Err(e) => {
                    if e.is_fatal() {
                        tracing::error!(error = %e, "fatal error, exiting");
                    } else {
                        warn!(error = %e, "surfacing error");
                    }
                    break Err(e);
                }
            }
        };

        self.shutdown().await;
        outcome
    }

    /// Allocates a fresh per-attempt cancellation context. Called at the
    /// top of every attempt, including retries after a reconnect, so a
    /// prior `shutdown()` cancelling the previous attempt's token can never
    /// leak into the next one.
    fn begin_attempt(&mut self) {
        self.cancel = self.parent_cancel.child_token();
    }

    async fn execute(&mut self, is_retry: bool) -> Result<(), DevError> {
        self.begin_attempt();

        // 1. Ensure sync engine binary exists locally.
        let binary_spec = BinarySpec {
            install_dir: self.config_home.join("syncthing").join("bin"),
            version: self.runtime.sync.version.clone(),
            download_base_url: self.runtime.sync.download_base_url.clone(),
        };

        // 2. The control-plane client was acquired for us at construction.

        // 3. Read the remote workload, bootstrapping a sandbox if missing.
        let deployments = self.deployments();
        let current = match deployments.get(&self.target.name).await {
            Ok(dep) => dep,
            Err(kube::Error::Api(e)) if e.code == 404 => self.create_sandbox(&deployments).await?,
            Err(e) => return Err(DevError::TransientControlPlane(e.to_string())),
        };

        let already_dev = current
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(SNAPSHOT_ANNOTATION))
            .map(|v| !v.is_empty())
            .unwrap_or(false);

        if is_retry && !already_dev {
            return Err(DevError::NotDevDeployment(self.target.name.clone()));
        }

        // 4. Consult the State Store for a collision on this exact manifest.
        let key = self.target.key();
        if let Some(existing) = self.store.all().await.map_err(|e| DevError::TransientControlPlane(e.to_string()))?
            .into_iter()
            .find(|r| r.key() == key)
        {
            if existing.manifest_path == self.manifest_path && !is_retry {
                return Err(DevError::AlreadyRunning(key));
            }
        }

        // Rule 9 needs the sidecar's TLS/API-key secret to exist before the
        // pod can start; ensure it up front and reuse the same key for the
        // locally-run engine below, so both sides agree on it.
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.target.namespace);
        let api_key = ensure_sync_secret(&secrets, &self.dev.name)
            .await
            .map_err(|e| DevError::TransientControlPlane(e.to_string()))?;

        // 5. Translate and submit, unless retrying into an already-dev workload.
        if !(is_retry && already_dev) {
            let translated = translate(&current, &self.dev, &self.target)?;
            let patch = serde_json::to_value(&translated)
                .map_err(|e| DevError::MalformedDevState(self.target.name.clone(), e.to_string()))?;
            deployments
                .patch(
                    &self.target.name,
                    &PatchParams::default(),
                    &Patch::Merge(&patch),
                )
                .await
                .map_err(|e| DevError::TransientControlPlane(e.to_string()))?;
        }

        // 6. Locate the running dev pod.
        let pod = get_dev_pod(self.client.clone(), &self.target.namespace, &self.dev.name, &self.cancel).await?;
        info!(pod = %pod, "dev pod located");

        // 7. Persist the ActivationRecord.
        let record = ActivationRecord {
            namespace: self.target.namespace.clone(),
            workload: self.target.name.clone(),
            container: self.target.container.clone().unwrap_or_default(),
            local_sync_address: format!("127.0.0.1:{SYNC_GUI_PORT}"),
            pod: pod.clone(),
            manifest_path: self.manifest_path.clone(),
            source_folder: std::env::current_dir()
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default(),
            started_at: chrono::Utc::now().to_rfc3339(),
        };
        self.store.insert(&key, &record).await?;

        // 8. Start the Sync Supervisor and forward its own two ports.
        let mut sync = SyncSupervisor::new(binary_spec, self.config_home.join("syncthing").join(&key));
        sync.run(self.folder_id(), api_key.clone(), SYNC_GUI_PORT, SYNC_DATA_PORT)
            .await?;

        let bind_address = crate::runtime::force_bind_address(&self.runtime);
        let mut forward = ForwardSupervisor::new(self.client.clone(), self.target.namespace.clone(), bind_address);

        // Drain the shared tunnel-event channel so a burst of events can
        // never back up into a tunnel's accept loop; this task ends on its
        // own once every sender (the supervisor and its tunnel tasks) is
        // dropped in `shutdown`.
        if let Some(mut events_rx) = forward.events_rx.take() {
            tokio::spawn(async move {
                while let Some(event) = events_rx.recv().await {
                    match event {
                        ForwardEvent::Ready { local, addr } => {
                            info!(local, addr, "forward tunnel ready");
                        }
                        ForwardEvent::Connected { local, peer } => {
                            info!(local, peer, "forward tunnel connected");
                        }
                        ForwardEvent::Closed { local } => {
                            info!(local, "forward tunnel closed");
                        }
                        ForwardEvent::Error { local, message } => {
                            warn!(local, message, "forward tunnel error");
                        }
                    }
                }
            });
        }

        forward
            .add(SYNC_DATA_PORT, SYNC_DATA_PORT)
            .map_err(|e| DevError::CommandFailed(e.to_string()))?;
        forward
            .add(SYNC_GUI_PORT, SYNC_GUI_PORT)
            .map_err(|e| DevError::CommandFailed(e.to_string()))?;

        // 9. Start each user-declared forward tunnel.
        let user_forwards = parse_forwards(&self.dev.forward)
            .map_err(|e| DevError::CommandFailed(e.to_string()))?;
        for pair in &user_forwards {
            forward
                .add(pair.local, pair.remote)
                .map_err(|e| DevError::CommandFailed(e.to_string()))?;
        }
        forward
            .start(&pod)
            .await
            .map_err(|e| DevError::TransientControlPlane(e.to_string()))?;

        // 10. Start the Sync Supervisor's Monitor. `run` above already
        // waited for the engine's REST port to answer, so the health loop
        // has something to probe from the moment it's spawned.
        let (disconnect_tx, disconnect_rx) = mpsc::channel(1);
        let monitor_handle = sync.spawn_monitor(disconnect_tx);

        // 11. Drive the mode progression.
        sync.wait_for_ping().await?;
        sync.wait_for_completion(&self.dev).await?;
        sync.override_changes(&self.dev).await?;
        sync.wait_for_completion(&self.dev).await?;
        sync.update_config_and_restart(self.folder_id(), api_key, SYNC_GUI_PORT, SYNC_DATA_PORT)
            .await?;
        debug_assert_eq!(sync.mode(), SyncMode::SendReceive);

        self.sync = Some(sync);
        self.forward = Some(forward);

        // 12. Enter Running: fork the interactive session as a child
        // invocation of this same binary.
        self.run_session(&pod, disconnect_rx, monitor_handle).await
    }

    async fn run_session(
        &mut self,
        pod: &str,
        mut disconnect_rx: mpsc::Receiver<()>,
        monitor_handle: Option<tokio::task::JoinHandle<()>>,
    ) -> Result<(), DevError> {
        let exe = std::env::current_exe().map_err(|e| DevError::CommandFailed(e.to_string()))?;

        let mut cmd = Command::new(exe);
        cmd.arg("exec")
            .arg("-f")
            .arg(&self.manifest_path)
            .arg("-n")
            .arg(&self.target.namespace)
            .arg("-p")
            .arg(pod)
            .arg("--");
        cmd.args(&self.dev.command);

        let mut child = cmd.spawn().map_err(|e| DevError::CommandFailed(e.to_string()))?;

        let result = tokio::select! {
            _ = self.cancel.cancelled() => {
                let _ = child.kill().await;
                Ok(())
            }
            status = child.wait() => {
                match status {
                    Ok(status) if status.success() => Ok(()),
                    Ok(status) => {
                        warn!(code = ?status.code(), "interactive session exited non-zero");
                        // A non-zero exit only re-enters the reconnection path
                        // if the Sync Supervisor has also reported
                        // disconnected; otherwise it bubbles up as
                        // CommandFailed.
                        if disconnect_rx.try_recv().is_ok() {
                            Err(DevError::LostConnection)
                        } else {
                            Err(DevError::CommandFailed(format!(
                                "remote command exited with code {:?}",
                                status.code()
                            )))
                        }
                    }
                    Err(e) => Err(DevError::CommandFailed(e.to_string())),
                }
            }
            _ = disconnect_rx.recv() => {
                let _ = child.kill().await;
                Err(DevError::LostConnection)
            }
        };

        if let Some(handle) = monitor_handle {
            handle.abort();
        }
        result
    }

    async fn create_sandbox(&self, deployments: &Api<Deployment>) -> Result<Deployment, DevError> {
        let image = self
            .dev
            .image
            .clone()
            .ok_or_else(|| DevError::MalformedDevState(self.target.name.clone(), "workload missing and no image to bootstrap one".into()))?;

        let manifest = serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": self.target.name },
            "spec": {
                "replicas": 1,
                "selector": { "matchLabels": { "app": self.target.name } },
                "template": {
                    "metadata": { "labels": { "app": self.target.name } },
                    "spec": {
                        "containers": [{ "name": "app", "image": image }]
                    }
                }
            }
        });
        let dep: Deployment = serde_json::from_value(manifest)
            .map_err(|e| DevError::MalformedDevState(self.target.name.clone(), e.to_string()))?;

        deployments
            .create(&PostParams::default(), &dep)
            .await
            .map_err(|e| DevError::TransientControlPlane(e.to_string()))
    }

    /// Cancels the controller context, waits briefly for tracked tasks,
    /// then stops the Forward Supervisor. Idempotent; safe in any state.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        tokio::time::sleep(Duration::from_millis(500)).await;

        if let Some(mut sync) = self.sync.take() {
            sync.stop().await;
        }
        if let Some(mut forward) = self.forward.take() {
            forward.stop().await;
        }
    }

    /// `Down`: restores the original spec, optionally cleans up volumes and
    /// the engine's state, and removes the ActivationRecord. `--force`
    /// makes each step best-effort.
    pub async fn down(&mut self, delete_volumes: bool, force: bool) -> Result<()> {
        let deployments = self.deployments();

        let current = deployments
            .get(&self.target.name)
            .await
            .context("failed to read workload for down")?;

        if let Some(raw) = current
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(SNAPSHOT_ANNOTATION))
            .filter(|v| !v.is_empty())
        {
            let restore_result = restore_snapshot(&deployments, &self.target.name, raw).await;
            if !force {
                restore_result?;
            }
        }

        if delete_volumes {
            let pvcs: Api<k8s_openapi::api::core::v1::PersistentVolumeClaim> =
                Api::namespaced(self.client.clone(), &self.target.namespace);

            let mut claim_names = vec![format!("devup-sync-{}", self.dev.name)];
            claim_names.extend(
                self.dev
                    .volumes
                    .iter()
                    .enumerate()
                    .map(|(idx, _)| format!("devup-vol-{idx}-{}", self.dev.name)),
            );

            for claim_name in claim_names {
                let result = pvcs.delete(&claim_name, &Default::default()).await;
                if !force {
                    result.with_context(|| format!("failed to delete volume {claim_name}"))?;
                }
            }
        }

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.target.namespace);
        let result = secrets
            .delete(&crate::k8s::secret::secret_name(&self.dev.name), &Default::default())
            .await;
        if !force {
            result.context("failed to delete sync engine secret")?;
        }

        self.store.delete(&self.target.key()).await?;

        let folder = self.config_home.join("syncthing").join(self.target.key());
        if folder.exists() {
            let result = tokio::fs::remove_dir_all(&folder).await;
            if !force {
                result.with_context(|| format!("failed to remove {}", folder.display()))?;
            }
        }

        Ok(())
    }
}

async fn restore_snapshot(deployments: &Api<Deployment>, name: &str, raw: &str) -> Result<()> {
    let mut snapshot: Deployment =
        serde_json::from_str(raw).context("snapshot annotation is not a valid deployment")?;

    let annotations = snapshot.metadata.annotations.get_or_insert_with(Default::default);
    annotations.remove(SNAPSHOT_ANNOTATION);

    // A JSON merge patch only deletes a key that's present with a `null`
    // value; simply omitting it (as dropping it from the in-memory map
    // would do once serialized) leaves the server's existing annotation
    // untouched.
    let mut patch = serde_json::to_value(&snapshot)?;
    patch["metadata"]["annotations"][SNAPSHOT_ANNOTATION] = serde_json::Value::Null;

    deployments
        .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .context("failed to restore original spec")?;
    Ok(())
}
