//! Container-image extraction from Kubernetes manifests.
//!
//! Walks `manifests/` for `.yaml`/`.yml`/`.tmpl` files and collects the
//! `image:` values of container specs. Files that are not valid YAML
//! (templates, mostly) fall back to a line scan.

use std::path::Path;

use kubeimage_core::{EngineError, Result};
use serde_yaml::Value;

use super::MANIFESTS_DIR;

/// Scan `tree/manifests` for container-image references.
pub fn scan_manifests(tree: &Path) -> Result<Vec<String>> {
    let dir = tree.join(MANIFESTS_DIR);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut images = Vec::new();
    let mut files = Vec::new();
    collect_files(&dir, &mut files)?;
    files.sort();

    for path in files {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        if ext != "yaml" && ext != "yml" && ext != "tmpl" {
            continue;
        }
        let text = std::fs::read_to_string(&path).map_err(|e| {
            EngineError::Storage(format!("cannot read manifest {}: {}", path.display(), e))
        })?;
        images.extend(images_from_yaml_text(&text));
    }

    Ok(images)
}

/// Extract image references from YAML text; multi-document aware, with a
/// line-scan fallback for text that does not parse.
pub(crate) fn images_from_yaml_text(text: &str) -> Vec<String> {
    let mut images = Vec::new();
    let mut parsed_any = false;

    for doc in text.split("\n---") {
        if doc.trim().is_empty() {
            continue;
        }
        match serde_yaml::from_str::<Value>(doc) {
            Ok(value) => {
                parsed_any = true;
                walk_containers(&value, &mut images);
            }
            Err(_) => {}
        }
    }

    if !parsed_any {
        images.extend(line_scan(text));
    }
    images
}

/// Collect `image` values of `containers`/`initContainers` entries.
fn walk_containers(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Mapping(map) => {
            for (key, val) in map {
                let is_container_list = matches!(
                    key.as_str(),
                    Some("containers") | Some("initContainers") | Some("ephemeralContainers")
                );
                if is_container_list {
                    if let Value::Sequence(seq) = val {
                        for item in seq {
                            if let Some(image) = item.get("image").and_then(Value::as_str) {
                                out.push(image.to_string());
                            }
                        }
                    }
                }
                walk_containers(val, out);
            }
        }
        Value::Sequence(seq) => {
            for item in seq {
                walk_containers(item, out);
            }
        }
        _ => {}
    }
}

/// Last-resort scan for `image:` lines in non-YAML text.
fn line_scan(text: &str) -> Vec<String> {
    let mut images = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim().trim_start_matches("- ");
        if let Some(rest) = trimmed.strip_prefix("image:") {
            let value = rest.trim();
            if !value.is_empty() {
                images.push(value.to_string());
            }
        }
    }
    images
}

fn collect_files(dir: &Path, out: &mut Vec<std::path::PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DEPLOYMENT: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  template:
    spec:
      initContainers:
        - name: setup
          image: busybox:1.33
      containers:
        - name: web
          image: nginx:1.19
        - name: sidecar
          image: "envoyproxy/envoy:v1.18.2"
"#;

    #[test]
    fn test_scan_deployment() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join(MANIFESTS_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("web.yaml"), DEPLOYMENT).unwrap();

        let images = scan_manifests(tmp.path()).unwrap();
        assert_eq!(
            images,
            vec!["busybox:1.33", "nginx:1.19", "envoyproxy/envoy:v1.18.2"]
        );
    }

    #[test]
    fn test_scan_missing_dir_is_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(scan_manifests(tmp.path()).unwrap().is_empty());
    }

    #[test]
    fn test_scan_skips_non_yaml_files() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join(MANIFESTS_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("notes.txt"), "image: should-not-appear").unwrap();
        assert!(scan_manifests(tmp.path()).unwrap().is_empty());
    }

    #[test]
    fn test_multi_document_yaml() {
        let text = "apiVersion: v1\nkind: Pod\nspec:\n  containers:\n  - image: a:1\n---\napiVersion: v1\nkind: Pod\nspec:\n  containers:\n  - image: b:2\n";
        assert_eq!(images_from_yaml_text(text), vec!["a:1", "b:2"]);
    }

    #[test]
    fn test_image_outside_container_spec_ignored() {
        // an `image` key that is not part of a container list is metadata,
        // not a pullable reference
        let text = "kind: Config\nimage: not-a-container\nspec:\n  containers:\n  - image: real:1\n";
        assert_eq!(images_from_yaml_text(text), vec!["real:1"]);
    }

    #[test]
    fn test_template_falls_back_to_line_scan() {
        let text = "spec:\n  {{- if .Values.enabled }}\n  containers:\n    - image: quay.io/coreos/etcd:v3.4\n  {{- end }}\n";
        let images = images_from_yaml_text(text);
        assert_eq!(images, vec!["quay.io/coreos/etcd:v3.4"]);
    }

    #[test]
    fn test_nested_subdirectories_scanned() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join(MANIFESTS_DIR).join("addons");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("dns.yml"),
            "spec:\n  containers:\n  - image: coredns/coredns:1.8.0\n",
        )
        .unwrap();
        assert_eq!(
            scan_manifests(tmp.path()).unwrap(),
            vec!["coredns/coredns:1.8.0"]
        );
    }
}
