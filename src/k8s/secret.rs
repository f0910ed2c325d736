//! Sync engine TLS material: the sidecar mounts a
//! read-only secret volume carrying the engine's TLS cert/key and the API
//! key used for its local REST control surface. Generated once per
//! workload and left in place across reconnects; `Down` deletes it.

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, Patch, PatchParams};
use rand::RngCore;
use std::collections::BTreeMap;

pub fn secret_name(dev_name: &str) -> String {
    format!("{dev_name}-tls")
}

/// Ensures the `<name>-tls` secret exists, creating it with a fresh
/// self-signed certificate and API key on first use. Returns the API key
/// so the caller can configure the local sync engine with the same value.
pub async fn ensure_sync_secret(
    secrets: &Api<Secret>,
    dev_name: &str,
) -> Result<String> {
    let name = secret_name(dev_name);

    if let Ok(existing) = secrets.get(&name).await {
        if let Some(api_key) = existing
            .data
            .as_ref()
            .and_then(|d| d.get("api-key"))
            .map(|b| String::from_utf8_lossy(&b.0).to_string())
        {
            return Ok(api_key);
        }
    }

    let api_key = generate_api_key();
    let (cert_pem, key_pem) = generate_self_signed_cert(dev_name)?;

    let mut data = BTreeMap::new();
    data.insert("cert.pem".to_string(), ByteString(cert_pem.into_bytes()));
    data.insert("key.pem".to_string(), ByteString(key_pem.into_bytes()));
    data.insert("api-key".to_string(), ByteString(api_key.clone().into_bytes()));

    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            ..Default::default()
        },
        data: Some(data),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    };

    secrets
        .patch(
            &name,
            &PatchParams::apply("devup").force(),
            &Patch::Apply(&secret),
        )
        .await
        .with_context(|| format!("failed to create sync engine secret {name}"))?;

    Ok(api_key)
}

fn generate_api_key() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn generate_self_signed_cert(dev_name: &str) -> Result<(String, String)> {
    let subject_alt_names = vec![format!("devup-sync-{dev_name}"), "localhost".to_string()];
    let cert_key = rcgen::generate_simple_self_signed(subject_alt_names)
        .context("failed to generate sync engine TLS certificate")?;
    Ok((cert_key.cert.pem(), cert_key.key_pair.serialize_pem()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_name_is_derived_from_dev_name() {
        assert_eq!(secret_name("api"), "api-tls");
    }

    #[test]
    fn api_keys_are_not_trivially_repeated() {
        assert_ne!(generate_api_key(), generate_api_key());
    }

    #[test]
    fn cert_generation_produces_pem_material() {
        let (cert, key) = generate_self_signed_cert("api").unwrap();
        assert!(cert.contains("BEGIN CERTIFICATE"));
        assert!(key.contains("PRIVATE KEY"));
    }
}
