//! Engine configuration.
//!
//! All tunables are passed explicitly into the engine constructors; there
//! is no global state. The CLI builds one `EngineConfig` per invocation.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::platform::Platform;

/// Default per-request registry timeout in seconds.
pub const DEFAULT_REGISTRY_TIMEOUT_SECS: u64 = 30;

/// Default number of layer blobs transferred concurrently.
pub const DEFAULT_BLOB_CONCURRENCY: usize = 4;

/// Registry and namespace an unqualified image name resolves against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameDefaults {
    pub registry: String,
    pub namespace: String,
}

impl Default for NameDefaults {
    fn default() -> Self {
        Self {
            registry: "docker.io".to_string(),
            namespace: "library".to_string(),
        }
    }
}

/// Configuration for the cluster-image engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root directory for layers, images, refs, cache, and mounts.
    pub root_dir: PathBuf,

    /// Defaults applied when an image name omits the registry/namespace.
    #[serde(default)]
    pub name_defaults: NameDefaults,

    /// Platform images are built for and resolved against.
    #[serde(default)]
    pub platform: Platform,

    /// Per-request timeout for registry HTTP operations, in seconds.
    #[serde(default = "default_registry_timeout")]
    pub registry_timeout_secs: u64,

    /// Overall wall-clock budget for a push or pull, in seconds.
    /// `None` means unbounded.
    #[serde(default)]
    pub transfer_budget_secs: Option<u64>,

    /// How many layer blobs are uploaded/downloaded concurrently.
    #[serde(default = "default_blob_concurrency")]
    pub blob_concurrency: usize,

    /// Talk plain HTTP to the registry (local registries only).
    #[serde(default)]
    pub insecure_registry: bool,
}

fn default_registry_timeout() -> u64 {
    DEFAULT_REGISTRY_TIMEOUT_SECS
}

fn default_blob_concurrency() -> usize {
    DEFAULT_BLOB_CONCURRENCY
}

impl EngineConfig {
    /// Configuration rooted at `root_dir` with defaults everywhere else.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            name_defaults: NameDefaults::default(),
            platform: Platform::host(),
            registry_timeout_secs: DEFAULT_REGISTRY_TIMEOUT_SECS,
            transfer_budget_secs: None,
            blob_concurrency: DEFAULT_BLOB_CONCURRENCY,
            insecure_registry: false,
        }
    }

    pub fn registry_timeout(&self) -> Duration {
        Duration::from_secs(self.registry_timeout_secs)
    }

    pub fn transfer_budget(&self) -> Option<Duration> {
        self.transfer_budget_secs.map(Duration::from_secs)
    }

    pub fn layers_dir(&self) -> PathBuf {
        self.root_dir.join("layers")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root_dir.join("images")
    }

    pub fn refs_dir(&self) -> PathBuf {
        self.root_dir.join("refs")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root_dir.join("cache")
    }

    pub fn mounts_dir(&self) -> PathBuf {
        self.root_dir.join("mounts")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root_dir.join("tmp")
    }
}
