//! Workload Translator: rewrites a target workload's spec into
//! dev mode — keep-alive command, sync sidecar, shared volume — and records
//! the original as a snapshot annotation so it can be restored later.
//!
//! Patch construction elsewhere in this crate goes through `serde_json::json!`
//! strategic merge patches; the translator itself works on the typed
//! `k8s_openapi` struct directly because it needs to read, mutate and
//! re-serialize the whole pod template, not apply a narrow patch.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, PersistentVolumeClaimVolumeSource, ResourceRequirements,
    SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::error::DevError;
use crate::manifest::{expand_environment, DevSpec, TargetWorkload};

pub const SNAPSHOT_ANNOTATION: &str = "dev.devup.dev/deployment";
pub const APP_LABEL: &str = "devup.dev/app";
const REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";

const SYNC_VOLUME: &str = "devup-sync";
const SECRET_VOLUME: &str = "devup-sync-tls";
const SYNC_IMAGE: &str = "devup/sync-engine:latest";
const SYNC_DATA_PORT: i32 = 22000;
const SYNC_GUI_PORT: i32 = 8384;

/// Parse the snapshot annotation, if present, back into a `Deployment`.
/// Returns `Ok(None)` when the workload has not been translated yet.
fn read_snapshot(current: &Deployment) -> Result<Option<Deployment>, DevError> {
    let annotations = match &current.metadata.annotations {
        Some(a) => a,
        None => return Ok(None),
    };

    let raw = match annotations.get(SNAPSHOT_ANNOTATION) {
        Some(raw) if !raw.is_empty() => raw,
        _ => return Ok(None),
    };

    let mut snapshot: Deployment = serde_json::from_str(raw).map_err(|e| {
        DevError::MalformedDevState(
            current.metadata.name.clone().unwrap_or_default(),
            e.to_string(),
        )
    })?;

    if let Some(annotations) = snapshot.metadata.annotations.as_mut() {
        annotations.remove(REVISION_ANNOTATION);
    }

    Ok(Some(snapshot))
}

/// Rule 1: pick the base spec to translate from, and the raw snapshot JSON
/// to carry forward onto the output annotation.
fn resolve_base(current: &Deployment) -> Result<(Deployment, String), DevError> {
    if let Some(snapshot) = read_snapshot(current)? {
        let raw = serde_json::to_string(&snapshot).map_err(|e| {
            DevError::MalformedDevState(
                current.metadata.name.clone().unwrap_or_default(),
                e.to_string(),
            )
        })?;
        Ok((snapshot, raw))
    } else {
        let mut original = current.clone();
        original.status = None;
        let raw = serde_json::to_string(&original).map_err(|e| {
            DevError::MalformedDevState(
                current.metadata.name.clone().unwrap_or_default(),
                e.to_string(),
            )
        })?;
        Ok((original, raw))
    }
}

/// Produce the dev-mode spec. Deterministic and idempotent: translating an
/// already-translated workload re-derives from its snapshot, never from the
/// already-translated form, so `translate(translate(x, dev), dev) ==
/// translate(x, dev)`.
pub fn translate(
    current: &Deployment,
    dev: &DevSpec,
    target: &TargetWorkload,
) -> Result<Deployment, DevError> {
    let (base, snapshot_raw) = resolve_base(current)?;
    let mut out = base;

    // Rule 2: clear status, force single-replica Recreate rollout.
    out.status = None;
    let spec = out.spec.get_or_insert_with(DeploymentSpec::default);
    spec.replicas = Some(1);
    spec.strategy = Some(DeploymentStrategy {
        type_: Some("Recreate".to_string()),
        rolling_update: None,
    });

    let pod_spec = spec
        .template
        .spec
        .get_or_insert_with(k8s_openapi::api::core::v1::PodSpec::default);
    pod_spec.termination_grace_period_seconds = Some(0);

    // Rule 3: label workload + pod template.
    let labels = out.metadata.labels.get_or_insert_with(BTreeMap::new);
    labels.insert(APP_LABEL.to_string(), dev.name.clone());
    let template_labels = spec
        .template
        .metadata
        .get_or_insert_with(Default::default)
        .labels
        .get_or_insert_with(BTreeMap::new);
    template_labels.insert(APP_LABEL.to_string(), dev.name.clone());

    // Rule 4: select and rewrite the target container.
    let container_name = target.container.clone();
    let target_container = select_container(&mut pod_spec.containers, container_name.as_deref())
        .ok_or_else(|| DevError::MalformedDevState(dev.name.clone(), "no containers in pod spec".into()))?;

    if let Some(image) = &dev.image {
        target_container.image = Some(image.clone());
    }
    target_container.image_pull_policy = Some("Always".to_string());
    target_container.command = Some(vec![
        "tail".to_string(),
        "-f".to_string(),
        "/dev/null".to_string(),
    ]);
    target_container.args = None;
    target_container.working_dir = Some(dev.workdir.clone());
    target_container.readiness_probe = None;
    target_container.liveness_probe = None;

    // Rule 5: merge environment, overwrite same-name entries, append the rest.
    let expanded = expand_environment(&dev.environment);
    let env = target_container.env.get_or_insert_with(Vec::new);
    for entry in expanded {
        if let Some(existing) = env.iter_mut().find(|e| e.name == entry.name) {
            existing.value = Some(entry.value);
        } else {
            env.push(EnvVar {
                name: entry.name,
                value: Some(entry.value),
                value_from: None,
            });
        }
    }

    // Rule 6: fixed small resource envelope.
    target_container.resources = Some(ResourceRequirements {
        requests: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity("125m".to_string())),
            ("memory".to_string(), Quantity("256Mi".to_string())),
        ])),
        limits: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity("1".to_string())),
            ("memory".to_string(), Quantity("2Gi".to_string())),
        ])),
        claims: None,
    });

    // Rule 7: mount the sync PV at the workdir, plus extra declared volumes.
    let mounts = target_container.volume_mounts.get_or_insert_with(Vec::new);
    upsert_mount(mounts, SYNC_VOLUME, &dev.workdir);
    for (idx, path) in dev.volumes.iter().enumerate() {
        upsert_mount(mounts, &format!("devup-vol-{idx}"), path);
    }

    // Rule 8: seed init container.
    let init_containers = pod_spec.init_containers.get_or_insert_with(Vec::new);
    if !init_containers.iter().any(|c| c.name == "devup-init") {
        init_containers.push(build_init_container(dev));
    }

    // Rule 9: sync sidecar.
    if !pod_spec.containers.iter().any(|c| c.name == "devup-sync") {
        pod_spec.containers.push(build_sync_sidecar(dev));
    }

    // Rule 10: ensure volume list carries the secret and PV references.
    let volumes = pod_spec.volumes.get_or_insert_with(Vec::new);
    ensure_volume(volumes, SYNC_VOLUME, Volume {
        name: SYNC_VOLUME.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: format!("{}-{}", SYNC_VOLUME, dev.name),
            read_only: Some(false),
        }),
        ..Default::default()
    });
    for (idx, _) in dev.volumes.iter().enumerate() {
        let name = format!("devup-vol-{idx}");
        ensure_volume(volumes, &name, Volume {
            name: name.clone(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: format!("{name}-{}", dev.name),
                read_only: Some(false),
            }),
            ..Default::default()
        });
    }
    ensure_volume(volumes, SECRET_VOLUME, Volume {
        name: SECRET_VOLUME.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(format!("{}-tls", dev.name)),
            ..Default::default()
        }),
        ..Default::default()
    });

    // Write the snapshot annotation onto the output.
    let annotations = out.metadata.annotations.get_or_insert_with(BTreeMap::new);
    annotations.insert(SNAPSHOT_ANNOTATION.to_string(), snapshot_raw);

    Ok(out)
}

fn select_container<'a>(
    containers: &'a mut [Container],
    name: Option<&str>,
) -> Option<&'a mut Container> {
    match name {
        Some(name) => containers.iter_mut().find(|c| c.name == name),
        None => containers.first_mut(),
    }
}

fn upsert_mount(mounts: &mut Vec<VolumeMount>, name: &str, path: &str) {
    if let Some(existing) = mounts.iter_mut().find(|m| m.name == name) {
        existing.mount_path = path.to_string();
        return;
    }
    mounts.push(VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    });
}

fn ensure_volume(volumes: &mut Vec<Volume>, name: &str, volume: Volume) {
    if !volumes.iter().any(|v| v.name == name) {
        volumes.push(volume);
    }
}

fn build_init_container(dev: &DevSpec) -> Container {
    let workdir = &dev.workdir;
    let script = format!(
        "if [ -z \"$(ls -A {workdir} 2>/dev/null | grep -v lost+found)\" ]; then cp -Rf {workdir}/* /init 2>/dev/null || true; fi; touch /init/.devup-ready"
    );

    Container {
        name: "devup-init".to_string(),
        image: Some("busybox:stable".to_string()),
        command: Some(vec!["sh".to_string(), "-c".to_string(), script]),
        volume_mounts: Some(vec![VolumeMount {
            name: SYNC_VOLUME.to_string(),
            mount_path: "/init".to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

fn build_sync_sidecar(dev: &DevSpec) -> Container {
    use k8s_openapi::api::core::v1::ContainerPort;

    Container {
        name: "devup-sync".to_string(),
        image: Some(SYNC_IMAGE.to_string()),
        volume_mounts: Some(vec![
            VolumeMount {
                name: SECRET_VOLUME.to_string(),
                mount_path: "/etc/devup/tls".to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: SYNC_VOLUME.to_string(),
                mount_path: dev.workdir.clone(),
                ..Default::default()
            },
        ]),
        ports: Some(vec![
            ContainerPort {
                name: Some("data".to_string()),
                container_port: SYNC_DATA_PORT,
                ..Default::default()
            },
            ContainerPort {
                name: Some("gui".to_string()),
                container_port: SYNC_GUI_PORT,
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn sample_deployment() -> Deployment {
        let mut d = Deployment {
            metadata: ObjectMeta {
                name: Some("api".to_string()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec::default()),
            ..Default::default()
        };
        let pod_spec = d
            .spec
            .as_mut()
            .unwrap()
            .template
            .spec
            .get_or_insert_with(Default::default);
        pod_spec.containers.push(Container {
            name: "app".to_string(),
            image: Some("prod:1".to_string()),
            command: Some(vec!["server".to_string()]),
            ..Default::default()
        });
        d
    }

    fn sample_dev() -> DevSpec {
        DevSpec {
            name: "api".to_string(),
            image: Some("node:18".to_string()),
            workdir: "/app".to_string(),
            ..Default::default()
        }
    }

    fn sample_target() -> TargetWorkload {
        TargetWorkload {
            namespace: "default".to_string(),
            name: "api".to_string(),
            container: None,
        }
    }

    #[test]
    fn rewrites_image_and_command() {
        let current = sample_deployment();
        let dev = sample_dev();
        let target = sample_target();

        let translated = translate(&current, &dev, &target).unwrap();
        let container = &translated.spec.unwrap().template.spec.unwrap().containers[0];
        assert_eq!(container.image.as_deref(), Some("node:18"));
        assert_eq!(
            container.command,
            Some(vec!["tail".to_string(), "-f".to_string(), "/dev/null".to_string()])
        );
    }

    #[test]
    fn is_idempotent_under_the_snapshot_rule() {
        let current = sample_deployment();
        let dev = sample_dev();
        let target = sample_target();

        let once = translate(&current, &dev, &target).unwrap();
        let twice = translate(&once, &dev, &target).unwrap();

        let once_json = serde_json::to_value(&once).unwrap();
        let twice_json = serde_json::to_value(&twice).unwrap();
        assert_eq!(once_json, twice_json);
    }

    #[test]
    fn snapshot_preserves_original_image_for_restore() {
        let current = sample_deployment();
        let dev = sample_dev();
        let target = sample_target();

        let translated = translate(&current, &dev, &target).unwrap();
        let annotations = translated.metadata.annotations.unwrap();
        let raw = annotations.get(SNAPSHOT_ANNOTATION).unwrap();
        let restored: Deployment = serde_json::from_str(raw).unwrap();
        let container = &restored.spec.unwrap().template.spec.unwrap().containers[0];
        assert_eq!(container.image.as_deref(), Some("prod:1"));
    }
}
