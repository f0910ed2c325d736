//! Sync Supervisor: launches and monitors the local sync engine
//! and drives it through the mode progression.
//!
//! Child-process management (piped stdout/stderr, line readers spawned as
//! tasks, `kill_on_drop`) and the REST polling in `rest.rs` follow the same
//! exponential-backoff poll-loop shape used elsewhere in this crate to wait
//! for a local process to come up.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::DevError;
use crate::manifest::DevSpec;
use crate::sync::binary::{ensure_binary, BinarySpec};
use crate::sync::rest::{SyncEndpoint, SyncRestClient};

const PING_DEADLINE: Duration = Duration::from_secs(30);
const COMPLETION_DEADLINE: Duration = Duration::from_secs(5 * 60);
const HEALTH_INTERVAL: Duration = Duration::from_secs(2);
const DISCONNECT_GRACE: Duration = Duration::from_secs(10);

/// Mode progression driven entirely by the Activation Controller; the
/// engine never transitions itself. Once `SendReceive`, the supervisor
/// does not change mode again for the invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Initialized,
    SendOnly,
    InitialSyncDone,
    SendReceive,
}

pub struct SyncSupervisor {
    binary_spec: BinarySpec,
    config_dir: PathBuf,
    endpoint: Option<SyncEndpoint>,
    child: Option<Child>,
    mode: SyncMode,
    rest: Option<SyncRestClient>,
}

impl SyncSupervisor {
    pub fn new(binary_spec: BinarySpec, config_dir: PathBuf) -> Self {
        Self {
            binary_spec,
            config_dir,
            endpoint: None,
            child: None,
            mode: SyncMode::Initialized,
            rest: None,
        }
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Launches the engine as a child process. Returns once the process is
    /// running and its REST port answers.
    pub async fn run(&mut self, folder_id: String, api_key: String, gui_port: u16, data_port: u16) -> Result<(), DevError> {
        let binary = ensure_binary(&self.binary_spec).await?;

        tokio::fs::create_dir_all(&self.config_dir)
            .await
            .map_err(|e| DevError::LocalDependencyMissing(e.to_string()))?;

        let mut cmd = Command::new(&binary);
        cmd.args([
            "--home",
            &self.config_dir.to_string_lossy(),
            "--gui-address",
            &format!("127.0.0.1:{gui_port}"),
            "--data-address",
            &format!("127.0.0.1:{data_port}"),
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| DevError::LocalDependencyMissing(e.to_string()))?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "sync-engine", "{line}");
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(target: "sync-engine", "{line}");
                }
            });
        }

        let endpoint = SyncEndpoint {
            gui_address: format!("127.0.0.1:{gui_port}"),
            api_key,
            remote_data_port: data_port,
            remote_gui_port: gui_port,
            folder_id,
        };
        let rest = SyncRestClient::new(endpoint.clone())
            .map_err(|e| DevError::LocalDependencyMissing(e.to_string()))?;

        rest.wait_for_ping(Duration::from_secs(10))
            .await
            .map_err(|e| DevError::LocalDependencyMissing(e.to_string()))?;

        self.child = Some(child);
        self.endpoint = Some(endpoint);
        self.rest = Some(rest);
        self.mode = SyncMode::SendOnly;
        info!("sync engine running and reachable");
        Ok(())
    }

    fn rest(&self) -> Result<&SyncRestClient> {
        self.rest.as_ref().ok_or_else(|| anyhow!("sync engine not started"))
    }

    /// Blocks until the remote peer has been seen at least once. Idempotent.
    pub async fn wait_for_ping(&self) -> Result<(), DevError> {
        self.rest()
            .map_err(|e| DevError::TransientControlPlane(e.to_string()))?
            .wait_for_ping(PING_DEADLINE)
            .await
            .map_err(|e| DevError::TransientControlPlane(e.to_string()))
    }

    /// Blocks until the folder's completion percentage reaches 100.
    pub async fn wait_for_completion(&self, _dev: &DevSpec) -> Result<(), DevError> {
        self.rest()
            .map_err(|e| DevError::TransientControlPlane(e.to_string()))?
            .wait_for_completion(COMPLETION_DEADLINE)
            .await
            .map_err(|e| DevError::TransientControlPlane(e.to_string()))
    }

    /// One-shot "push local over remote" directive. Used exactly once,
    /// after the first `wait_for_completion`, to resolve the initial
    /// seeding race deterministically in favor of the local copy: during
    /// initial attach the workstation is the source of truth.
    pub async fn override_changes(&mut self, _dev: &DevSpec) -> Result<(), DevError> {
        self.rest()
            .map_err(|e| DevError::TransientControlPlane(e.to_string()))?
            .override_changes()
            .await
            .map_err(|e| DevError::TransientControlPlane(e.to_string()))?;
        self.mode = SyncMode::InitialSyncDone;
        Ok(())
    }

    /// Mutates mode from send-only to send-receive and restarts the engine
    /// in place to pick up the new config.
    pub async fn update_config_and_restart(&mut self, folder_id: String, api_key: String, gui_port: u16, data_port: u16) -> Result<(), DevError> {
        if self.mode == SyncMode::SendReceive {
            return Ok(());
        }
        self.stop().await;
        self.run(folder_id, api_key, gui_port, data_port).await?;
        self.mode = SyncMode::SendReceive;
        Ok(())
    }

    /// Spawns the health-check loop as its own task, started right after
    /// `run` so it is live for the rest of the activation: the Monitor task
    /// is started only after initial sync has at least reached ping, which
    /// holds because `run` already waited for the first ping before
    /// returning. Sends exactly one value on `disconnect_tx` if the
    /// engine's health endpoint fails for longer than `DISCONNECT_GRACE`,
    /// then exits; it is the only writer to that channel. Returns `None` if
    /// the engine hasn't been started yet. Aborting the returned handle is
    /// cancellation-safe — there's no state to unwind.
    pub fn spawn_monitor(&self, disconnect_tx: mpsc::Sender<()>) -> Option<tokio::task::JoinHandle<()>> {
        let rest = self.rest.clone()?;

        Some(tokio::spawn(async move {
            let mut unhealthy_since: Option<tokio::time::Instant> = None;

            loop {
                tokio::time::sleep(HEALTH_INTERVAL).await;

                if rest.is_alive().await {
                    unhealthy_since = None;
                    continue;
                }

                let since = unhealthy_since.get_or_insert_with(tokio::time::Instant::now);
                if since.elapsed() >= DISCONNECT_GRACE {
                    warn!("sync engine unreachable past grace window; signalling disconnect");
                    let _ = disconnect_tx.send(()).await;
                    return;
                }
            }
        }))
    }

    /// Terminates the engine and deletes its working state.
    pub async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill().await;
        }
        self.rest = None;
    }

    pub async fn remove_folder(&mut self) -> Result<()> {
        if self.config_dir.exists() {
            tokio::fs::remove_dir_all(&self.config_dir)
                .await
                .with_context(|| format!("failed to remove {}", self.config_dir.display()))?;
        }
        Ok(())
    }
}
