//! Chain-id keyed build cache.
//!
//! Maps the chain id of a build prefix to the layer id a previous build
//! produced for it. The index persists at `cache/index`; writers
//! serialize behind a lock and swap in a fresh snapshot, readers clone
//! the current snapshot without blocking writers. A probe is a hit only
//! if the referenced layer still exists locally; misses are never errors.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use kubeimage_core::Result;
use tracing::{debug, warn};

use crate::build::clusterfile::Instruction;
use crate::digest::{chain_digest, instruction_digest};
use crate::store::LayerStore;

const INDEX_FILE: &str = "index";

/// Result of a cache probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheProbe {
    pub hit: bool,
    /// Layer to reuse on a hit.
    pub layer_id: Option<String>,
    /// Chain id for this step, hit or miss; becomes the next step's parent.
    pub chain_id: String,
}

/// Chain-id → layer-id index.
pub struct CacheService {
    index_path: PathBuf,
    inner: RwLock<Arc<HashMap<String, String>>>,
}

impl CacheService {
    /// Open the cache under `cache_dir`, loading any existing index.
    ///
    /// An unreadable index is discarded: the cache is an accelerator, a
    /// corrupt one must not fail builds.
    pub fn open(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir)?;
        let index_path = cache_dir.join(INDEX_FILE);

        let map = match std::fs::read(&index_path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(map) => map,
                Err(e) => {
                    warn!(index = %index_path.display(), error = %e, "discarding unreadable cache index");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Ok(Self {
            index_path,
            inner: RwLock::new(Arc::new(map)),
        })
    }

    /// Probe for a prior result of `instruction` after `parent_chain`.
    ///
    /// `input_digest` carries the step's materialised inputs: the source
    /// cache id of a local `COPY`, or the digest of a `RUN`'s expanded
    /// command line.
    pub fn probe(
        &self,
        parent_chain: &str,
        instruction: &Instruction,
        input_digest: Option<&str>,
        layers: &LayerStore,
    ) -> CacheProbe {
        let digest = instruction_digest(
            instruction.kind.as_str(),
            &instruction.value,
            input_digest,
        );
        let chain_id = chain_digest(parent_chain, &digest);

        if let Some(layer_id) = self.snapshot().get(&chain_id) {
            if layers.contains(layer_id) {
                debug!(chain = %chain_id, layer = %layer_id, "cache hit");
                return CacheProbe {
                    hit: true,
                    layer_id: Some(layer_id.clone()),
                    chain_id,
                };
            }
            debug!(chain = %chain_id, layer = %layer_id, "cached layer missing locally, treating as miss");
        }

        CacheProbe {
            hit: false,
            layer_id: None,
            chain_id,
        }
    }

    /// Record a build result. Called only after the layer is committed.
    pub fn put(&self, chain_id: &str, layer_id: &str) -> Result<()> {
        let snapshot = {
            let mut guard = self.inner.write().expect("cache lock poisoned");
            let mut map = (**guard).clone();
            map.insert(chain_id.to_string(), layer_id.to_string());
            let snapshot = Arc::new(map);
            *guard = snapshot.clone();
            snapshot
        };

        let tmp = self.index_path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&*snapshot)?)?;
        std::fs::rename(&tmp, &self.index_path)?;
        Ok(())
    }

    /// Current index snapshot; never blocks on writers for long.
    pub fn snapshot(&self) -> Arc<HashMap<String, String>> {
        self.inner.read().expect("cache lock poisoned").clone()
    }
}
