//! Manifest validation: the hard errors that must stop a load.

use anyhow::{anyhow, Result};

use super::types::DevSpec;

const MAX_VOLUMES: usize = 2;

pub fn validate(spec: &DevSpec) -> Result<()> {
    if spec.name.trim().is_empty() {
        return Err(anyhow!("manifest: 'name' is required"));
    }

    if spec.volumes.len() > MAX_VOLUMES {
        return Err(anyhow!(
            "manifest: at most {} extra volumes are supported, got {}",
            MAX_VOLUMES,
            spec.volumes.len()
        ));
    }

    for raw in &spec.forward {
        super::loader::parse_forward_pair(raw)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_spec() -> DevSpec {
        DevSpec {
            name: "api".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn rejects_missing_name() {
        let spec = DevSpec {
            name: String::new(),
            ..Default::default()
        };
        assert!(validate(&spec).is_err());
    }

    #[test]
    fn rejects_too_many_volumes() {
        let mut spec = base_spec();
        spec.volumes = vec!["a".into(), "b".into(), "c".into()];
        assert!(validate(&spec).is_err());
    }

    #[test]
    fn accepts_well_formed_spec() {
        let mut spec = base_spec();
        spec.volumes = vec!["cache".into()];
        spec.forward = vec!["8080:8080".into()];
        assert!(validate(&spec).is_ok());
    }
}
