use devup::k8s::resolve_namespace;
use devup::manifest::ManifestLoader;

#[test]
fn loads_validates_and_resolves_a_full_manifest_end_to_end() {
    std::env::set_var("DEVUP_TEST_DEBUG", "1");

    let dir = tempfile::tempdir().unwrap();
    let manifest_path = dir.path().join("devup.yml");
    std::fs::write(
        &manifest_path,
        r#"
name: api
namespace: staging
image: node:18
workdir: /app
command: ["/bin/sh", "-c", "tail -f /dev/null"]
environment:
  - "NODE_ENV=development"
  - "DEBUG=$DEVUP_TEST_DEBUG"
  - "EMPTY="
forward:
  - "3000:3000"
  - "9229:9229"
volumes:
  - "node_modules"
"#,
    )
    .unwrap();

    let loader = ManifestLoader::new(Some(manifest_path.to_str().unwrap()));
    let (dev, resolved_path) = loader.load_with_path().unwrap();

    assert_eq!(dev.name, "api");
    assert_eq!(dev.image.as_deref(), Some("node:18"));
    assert_eq!(dev.forward, vec!["3000:3000", "9229:9229"]);
    assert_eq!(dev.volumes, vec!["node_modules"]);
    assert_eq!(resolved_path, manifest_path);

    // Namespace precedence: no flag, so the manifest's own value wins over
    // whatever the local kubeconfig context happens to say.
    let namespace = resolve_namespace(None, dev.namespace.as_deref());
    assert_eq!(namespace, "staging");

    // An explicit flag still overrides the manifest.
    let namespace = resolve_namespace(Some("prod"), dev.namespace.as_deref());
    assert_eq!(namespace, "prod");

    std::env::remove_var("DEVUP_TEST_DEBUG");
}

#[test]
fn rejects_a_manifest_with_too_many_volumes() {
    let dir = tempfile::tempdir().unwrap();
    let manifest_path = dir.path().join("devup.yml");
    std::fs::write(
        &manifest_path,
        r#"
name: api
volumes:
  - "a"
  - "b"
  - "c"
"#,
    )
    .unwrap();

    let loader = ManifestLoader::new(Some(manifest_path.to_str().unwrap()));
    assert!(loader.load().is_err());
}

#[test]
fn missing_explicit_manifest_path_is_an_error() {
    let loader = ManifestLoader::new(Some("/nonexistent/devup.yml"));
    assert!(loader.load().is_err());
}
