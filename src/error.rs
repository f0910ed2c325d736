//! Error kinds shared across the activation lifecycle.
//!
//! Most call sites propagate failures through `anyhow::Result` so they can
//! attach `.context(...)`. The Activation Controller needs to dispatch on
//! *kind* though (reconnect vs. surface vs. fatal), so the kinds that
//! matter for that dispatch are a real enum rather than string matching on
//! an `anyhow::Error`.

use thiserror::Error;

/// Named error kinds the Activation Controller can act on.
#[derive(Debug, Error)]
pub enum DevError {
    /// A control-plane request failed in a way that's worth retrying at the
    /// controller level (timeouts, connection resets).
    #[error("transient control-plane error: {0}")]
    TransientControlPlane(String),

    /// Raised by the Sync Supervisor's `Monitor` task when the engine's
    /// health endpoint has been unreachable past the grace window.
    #[error("lost connection to sync engine")]
    LostConnection,

    /// The interactive child exited non-zero, or its local transport died.
    #[error("command failed: {0}")]
    CommandFailed(String),

    /// The State Store already holds a live record for this key.
    #[error("an environment is already active for {0}")]
    AlreadyRunning(String),

    /// On reconnect, the remote workload no longer carries the snapshot
    /// annotation: it was reset from outside devup.
    #[error("workload {0} is no longer in dev mode; run `devup down` and start over")]
    NotDevDeployment(String),

    /// More than one running pod matches the dev selector.
    #[error("ambiguous dev pod: found {0:?}, restart your environment")]
    AmbiguousPod(Vec<String>),

    /// No single running pod appeared before the Pod Locator's deadline.
    #[error("creation is taking too long: no dev pod appeared within {0:?}")]
    PodCreationTimeout(std::time::Duration),

    /// The snapshot annotation exists but could not be parsed.
    #[error("malformed dev state on {0}: {1}")]
    MalformedDevState(String, String),

    /// The sync engine binary is missing locally and could not be fetched.
    #[error("sync engine binary unavailable: {0}")]
    LocalDependencyMissing(String),

    /// User interrupt or controller-initiated shutdown. Not a failure.
    #[error("cancelled")]
    Cancelled,
}

impl DevError {
    /// Whether this error should trigger the reconnection path rather than
    /// being surfaced or treated as fatal.
    pub fn is_reconnectable(&self) -> bool {
        matches!(self, DevError::LostConnection)
    }

    /// Whether this error is fatal: no retry, no reconnect, just exit.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DevError::NotDevDeployment(_)
                | DevError::AmbiguousPod(_)
                | DevError::PodCreationTimeout(_)
                | DevError::MalformedDevState(_, _)
                | DevError::LocalDependencyMissing(_)
                | DevError::AlreadyRunning(_)
        )
    }
}
