//! Manifest data types: the user-declared intent for a dev environment.

use serde::{Deserialize, Serialize};

fn default_command() -> Vec<String> {
    vec!["/bin/sh".to_string()]
}

fn default_workdir() -> String {
    "/app".to_string()
}

/// `DevSpec` — parsed straight from the manifest YAML.
///
/// `name` and `image` are the only manifest keys without a usable default:
/// `name` has none at all (validation rejects an empty one), `image` is only
/// required when `up` has to bootstrap a sandbox deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DevSpec {
    pub name: String,

    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default)]
    pub image: Option<String>,

    #[serde(default = "default_workdir")]
    pub workdir: String,

    #[serde(default = "default_command")]
    pub command: Vec<String>,

    #[serde(default)]
    pub environment: Vec<String>,

    #[serde(default)]
    pub volumes: Vec<String>,

    #[serde(default)]
    pub forward: Vec<String>,

    #[serde(default)]
    pub container: Option<String>,
}

/// One resolved `NAME=value` environment entry after `$VAR` expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvEntry {
    pub name: String,
    pub value: String,
}

/// One resolved `local:remote` port pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardPair {
    pub local: u16,
    pub remote: u16,
}

/// A reference to the remote workload being put into dev mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetWorkload {
    pub namespace: String,
    pub name: String,
    pub container: Option<String>,
}

impl TargetWorkload {
    pub fn key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.namespace,
            self.name,
            self.container.as_deref().unwrap_or("")
        )
    }
}
