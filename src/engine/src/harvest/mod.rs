//! Embedded-image harvesting.
//!
//! A cluster image carries the container images its manifests, charts,
//! and image list refer to, so clusters come up without reaching any
//! external registry. During a `COPY` into `manifests`, `charts`, or the
//! image list, the harvester extracts every reference from the collected
//! tree and asks a [`Saver`] to deposit the referenced blobs under the
//! tree's `registry/` directory — inside the same layer.

mod charts;
mod manifests;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use kubeimage_core::{EngineError, Platform, Result};
use tracing::info;

pub use charts::scan_charts;
pub use manifests::scan_manifests;

/// Destination directory that triggers manifest harvesting.
pub const MANIFESTS_DIR: &str = "manifests";
/// Destination directory that triggers chart harvesting.
pub const CHARTS_DIR: &str = "charts";
/// File under `manifests/` listing raw references, one per line.
pub const IMAGE_LIST_FILE: &str = "imageList";
/// Directory inside a layer where harvested blobs are deposited.
pub const REGISTRY_DIR: &str = "registry";

/// Deposits container-image blobs for a set of references.
///
/// The engine's default saver pulls via the registry client; tests and
/// air-gapped callers plug in their own.
#[async_trait]
pub trait Saver: Send + Sync {
    async fn save_images(&self, images: &[String], dir: &Path, platform: &Platform) -> Result<()>;
}

/// Runs the three scanners and feeds the result to a saver.
pub struct Harvester {
    saver: Arc<dyn Saver>,
    platform: Platform,
}

impl Harvester {
    pub fn new(saver: Arc<dyn Saver>, platform: Platform) -> Self {
        Self { saver, platform }
    }

    /// Whether a `COPY` destination obliges harvesting.
    pub fn applies_to(dest: &str) -> bool {
        dest == MANIFESTS_DIR || dest == CHARTS_DIR || dest == IMAGE_LIST_FILE
    }

    /// Scan `tree` and save every referenced image under
    /// `tree/registry/`. Returns the deduplicated reference list.
    pub async fn process(&self, tree: &Path) -> Result<Vec<String>> {
        let images = self.scan(tree).await?;
        if images.is_empty() {
            return Ok(images);
        }

        info!(count = images.len(), "saving embedded container images");
        self.saver
            .save_images(&images, &tree.join(REGISTRY_DIR), &self.platform)
            .await?;
        Ok(images)
    }

    /// Run the three scanners concurrently and join their results in a
    /// fixed order (manifests, charts, image list), deduplicated.
    pub async fn scan(&self, tree: &Path) -> Result<Vec<String>> {
        let (m_tree, c_tree, l_tree) =
            (tree.to_path_buf(), tree.to_path_buf(), tree.to_path_buf());
        let (from_manifests, from_charts, from_list) = tokio::join!(
            tokio::task::spawn_blocking(move || scan_manifests(&m_tree)),
            tokio::task::spawn_blocking(move || scan_charts(&c_tree)),
            tokio::task::spawn_blocking(move || scan_image_list(&l_tree)),
        );

        let mut collected = Vec::new();
        let mut errors = Vec::new();
        for joined in [from_manifests, from_charts, from_list] {
            match joined {
                Ok(Ok(images)) => collected.extend(images),
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(EngineError::Storage(format!("scanner panicked: {}", e))),
            }
        }
        if !errors.is_empty() {
            return Err(EngineError::aggregate(errors));
        }

        Ok(format_images(collected))
    }
}

/// Read `manifests/imageList`: one reference per non-empty, non-`#` line.
pub fn scan_image_list(tree: &Path) -> Result<Vec<String>> {
    let path = tree.join(MANIFESTS_DIR).join(IMAGE_LIST_FILE);
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let text = std::fs::read_to_string(&path)
        .map_err(|e| EngineError::Storage(format!("cannot read {}: {}", path.display(), e)))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// Trim surrounding quotes/whitespace and deduplicate, keeping the first
/// appearance of each reference.
fn format_images(raw: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for image in raw {
        let trimmed = image
            .trim()
            .trim_matches('"')
            .trim_matches('\'')
            .trim()
            .to_string();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.clone()) {
            out.push(trimmed);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records what it was asked to save; writes a marker per image.
    #[derive(Default)]
    struct RecordingSaver {
        calls: Mutex<Vec<(Vec<String>, std::path::PathBuf)>>,
    }

    #[async_trait]
    impl Saver for RecordingSaver {
        async fn save_images(
            &self,
            images: &[String],
            dir: &Path,
            _platform: &Platform,
        ) -> Result<()> {
            std::fs::create_dir_all(dir)?;
            for image in images {
                std::fs::write(dir.join(image.replace(['/', ':'], "_")), image)?;
            }
            self.calls
                .lock()
                .unwrap()
                .push((images.to_vec(), dir.to_path_buf()));
            Ok(())
        }
    }

    struct FailingSaver;

    #[async_trait]
    impl Saver for FailingSaver {
        async fn save_images(&self, _: &[String], _: &Path, _: &Platform) -> Result<()> {
            Err(EngineError::Registry {
                registry: "registry.example.com".to_string(),
                message: "boom".to_string(),
            })
        }
    }

    fn platform() -> Platform {
        Platform::parse("linux/amd64").unwrap()
    }

    fn seed_tree(tmp: &TempDir) {
        let manifests = tmp.path().join(MANIFESTS_DIR);
        std::fs::create_dir_all(&manifests).unwrap();
        std::fs::write(
            manifests.join("dep.yaml"),
            "spec:\n  containers:\n  - image: nginx:1.19\n  - image: 'busybox:1.33'\n",
        )
        .unwrap();
        std::fs::write(
            manifests.join(IMAGE_LIST_FILE),
            "# pinned\nnginx:1.19\nquay.io/org/tool:v3\n\n",
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_process_saves_into_registry_dir() {
        let tmp = TempDir::new().unwrap();
        seed_tree(&tmp);
        let saver = Arc::new(RecordingSaver::default());
        let harvester = Harvester::new(saver.clone(), platform());

        let images = harvester.process(tmp.path()).await.unwrap();
        assert_eq!(
            images,
            vec!["nginx:1.19", "busybox:1.33", "quay.io/org/tool:v3"]
        );

        let calls = saver.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, tmp.path().join(REGISTRY_DIR));
        assert!(tmp.path().join(REGISTRY_DIR).join("nginx_1.19").is_file());
    }

    #[tokio::test]
    async fn test_scan_dedupes_preserving_first_appearance() {
        let tmp = TempDir::new().unwrap();
        seed_tree(&tmp);
        let harvester = Harvester::new(Arc::new(RecordingSaver::default()), platform());

        let images = harvester.scan(tmp.path()).await.unwrap();
        // nginx appears in both the manifest and the list; kept once, first
        assert_eq!(
            images,
            vec!["nginx:1.19", "busybox:1.33", "quay.io/org/tool:v3"]
        );
    }

    #[tokio::test]
    async fn test_scan_idempotent() {
        let tmp = TempDir::new().unwrap();
        seed_tree(&tmp);
        let harvester = Harvester::new(Arc::new(RecordingSaver::default()), platform());
        let first = harvester.scan(tmp.path()).await.unwrap();
        let second = harvester.scan(tmp.path()).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_empty_tree_skips_saver() {
        let tmp = TempDir::new().unwrap();
        let harvester = Harvester::new(Arc::new(FailingSaver), platform());
        // nothing to harvest, so the failing saver is never invoked
        assert!(harvester.process(tmp.path()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_saver_failure_propagates() {
        let tmp = TempDir::new().unwrap();
        seed_tree(&tmp);
        let harvester = Harvester::new(Arc::new(FailingSaver), platform());
        assert!(matches!(
            harvester.process(tmp.path()).await,
            Err(EngineError::Registry { .. })
        ));
    }

    #[test]
    fn test_applies_to() {
        assert!(Harvester::applies_to("manifests"));
        assert!(Harvester::applies_to("charts"));
        assert!(Harvester::applies_to("imageList"));
        assert!(!Harvester::applies_to("etc"));
        assert!(!Harvester::applies_to("bin"));
    }

    #[test]
    fn test_scan_image_list_filters_comments() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join(MANIFESTS_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(IMAGE_LIST_FILE), "a:1\n# b:2\n\n  c:3  \n").unwrap();
        assert_eq!(scan_image_list(tmp.path()).unwrap(), vec!["a:1", "c:3"]);
    }

    #[test]
    fn test_format_images() {
        let out = format_images(vec![
            "  nginx:1.19 ".to_string(),
            "\"nginx:1.19\"".to_string(),
            "'redis:6'".to_string(),
            "".to_string(),
        ]);
        assert_eq!(out, vec!["nginx:1.19", "redis:6"]);
    }
}
