//! Thin wrapper around a `kube::Client`, adapted from the inspector's
//! client setup: same config inference / kubeconfig-override logic, trimmed
//! to what the activation lifecycle actually needs (no cluster-summary
//! dashboard queries).

use anyhow::{Context, Result};
use kube::{config::Kubeconfig, Client, Config};

/// A connected Kubernetes client.
#[derive(Clone)]
pub struct K8sClient {
    pub client: Client,
}

impl K8sClient {
    /// Infer configuration the standard way: `KUBECONFIG`/`~/.kube/config`
    /// or in-cluster service account, matching `Config::infer`'s search
    /// order.
    pub async fn new() -> Result<Self> {
        let config = Config::infer()
            .await
            .context("failed to infer kubeconfig")?;
        let client = Client::try_from(config).context("failed to build Kubernetes client")?;
        Ok(Self { client })
    }

    /// The namespace set on the kubeconfig's current context, falling back
    /// to `"default"` when unset or the file can't be read (e.g. in-cluster
    /// auth, which has no kubeconfig file at all).
    pub fn current_context_namespace() -> String {
        Kubeconfig::read()
            .ok()
            .and_then(|cfg| {
                let current = cfg.current_context.clone()?;
                cfg.contexts
                    .into_iter()
                    .find(|named| named.name == current)
                    .and_then(|named| named.context)
                    .and_then(|ctx| ctx.namespace)
            })
            .unwrap_or_else(|| "default".to_string())
    }
}

/// Resolve the namespace to operate against.
///
/// Precedence: explicit flag, then the manifest's own `namespace` key, then
/// the kubeconfig's current context. This is the single helper the
/// Activation Controller's `Down` path and `up`/`exec` entry points all call.
pub fn resolve_namespace(flag: Option<&str>, manifest: Option<&str>) -> String {
    if let Some(ns) = flag.filter(|s| !s.is_empty()) {
        return ns.to_string();
    }
    if let Some(ns) = manifest.filter(|s| !s.is_empty()) {
        return ns.to_string();
    }
    K8sClient::current_context_namespace()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_wins_over_manifest() {
        assert_eq!(resolve_namespace(Some("flag-ns"), Some("manifest-ns")), "flag-ns");
    }

    #[test]
    fn manifest_wins_over_context() {
        assert_eq!(resolve_namespace(None, Some("manifest-ns")), "manifest-ns");
    }

    #[test]
    fn empty_flag_falls_through_to_manifest() {
        assert_eq!(resolve_namespace(Some(""), Some("manifest-ns")), "manifest-ns");
    }
}
