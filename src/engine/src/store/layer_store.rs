//! Content-addressed layer store.
//!
//! Layer payloads live as plain directory trees under
//! `layers/<aa>/<id>/…`, where `<id>` is the SHA-256 of the canonical tar
//! of the tree and `<aa>` its first two hex characters. An opaque
//! key→bytes sidecar sits next to each payload at
//! `layers/<aa>/<id>.metadata/<key>`; the build cache id and the
//! per-registry distribution digests are stored there.
//!
//! Registration stages the tree and commits it with a single rename, so a
//! crash never leaves a half-registered layer visible.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kubeimage_core::{EngineError, Result};
use tracing::debug;

use crate::archive::{spool_canonical_tar, tree_digest};
use crate::digest::is_digest_hex;
use crate::image::LAYER_MEDIA_TYPE;

/// Metadata key under which a `COPY` layer's source cache id is stored.
pub const CACHE_ID_KEY: &str = "cache-id";

/// Metadata key holding the uncompressed tar size.
const SIZE_KEY: &str = "size";

/// Metadata key holding the registry→distribution-digest map.
const DISTRIBUTION_KEY: &str = "distribution";

/// A registered, immutable layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    pub id: String,
    /// Uncompressed size of the canonical tar in bytes.
    pub size: u64,
    pub media_type: String,
}

/// Content-addressed store of layer payloads and per-layer metadata.
#[derive(Clone)]
pub struct LayerStore {
    root: PathBuf,
    staging: PathBuf,
}

impl LayerStore {
    /// Open (and create if needed) a layer store.
    ///
    /// `staging` must be on the same filesystem as `root` so the commit
    /// rename stays atomic.
    pub fn new(root: impl Into<PathBuf>, staging: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let staging = staging.into();
        std::fs::create_dir_all(&root)?;
        std::fs::create_dir_all(&staging)?;
        Ok(Self { root, staging })
    }

    /// Register the directory tree at `path` as a layer.
    ///
    /// Canonicalises, hashes, and moves the tree into place; idempotent
    /// when a layer with the same contents already exists. The caller
    /// gives up ownership of `path` on success (it may be renamed away).
    pub fn register(&self, path: &Path) -> Result<String> {
        let (id, size) = tree_digest(path)?;

        let final_path = self.payload_path(&id);
        if final_path.exists() {
            debug!(layer = %id, "layer already registered");
            return Ok(id);
        }

        std::fs::create_dir_all(final_path.parent().unwrap())?;

        // Prefer a direct rename of the caller's tree; fall back to a
        // staged copy when the source sits on another filesystem.
        if std::fs::rename(path, &final_path).is_err() {
            let stage = self.staging.join(&id);
            if stage.exists() {
                std::fs::remove_dir_all(&stage)?;
            }
            if let Err(e) = copy_tree(path, &stage) {
                let _ = std::fs::remove_dir_all(&stage);
                return Err(e);
            }
            if let Err(e) = std::fs::rename(&stage, &final_path) {
                let _ = std::fs::remove_dir_all(&stage);
                // lost a race with a concurrent writer of the same id
                if final_path.exists() {
                    return Ok(id);
                }
                return Err(EngineError::Storage(format!(
                    "failed to commit layer {}: {}",
                    id, e
                )));
            }
        }

        self.set_metadata(&id, SIZE_KEY, size.to_string().as_bytes())?;
        debug!(layer = %id, size, "registered layer");
        Ok(id)
    }

    /// Look up a layer.
    pub fn get(&self, id: &str) -> Result<Option<Layer>> {
        if !self.contains(id) {
            return Ok(None);
        }
        Ok(Some(Layer {
            id: id.to_string(),
            size: self.size(id)?,
            media_type: LAYER_MEDIA_TYPE.to_string(),
        }))
    }

    pub fn contains(&self, id: &str) -> bool {
        is_digest_hex(id) && self.payload_path(id).is_dir()
    }

    /// Absolute path of a layer's payload tree.
    pub fn payload_path(&self, id: &str) -> PathBuf {
        self.root.join(shard(id)).join(id)
    }

    /// Uncompressed tar size of a layer.
    pub fn size(&self, id: &str) -> Result<u64> {
        if let Some(bytes) = self.get_metadata(id, SIZE_KEY)? {
            if let Ok(s) = String::from_utf8_lossy(&bytes).parse::<u64>() {
                return Ok(s);
            }
        }
        // metadata lost; recompute and re-cache
        let (_, size) = tree_digest(&self.require(id)?)?;
        self.set_metadata(id, SIZE_KEY, size.to_string().as_bytes())?;
        Ok(size)
    }

    /// Write the layer's canonical tar to `spool`, verifying the payload
    /// against its id on the way out.
    pub fn tar_spool(&self, id: &str, spool: &Path) -> Result<u64> {
        let path = self.require(id)?;
        let (digest, size) = spool_canonical_tar(&path, spool)?;
        if digest != id {
            return Err(EngineError::Storage(format!(
                "layer {} is corrupt: payload hashes to {}",
                id, digest
            )));
        }
        Ok(size)
    }

    /// Recompute a layer's digest and fail on mismatch.
    pub fn verify(&self, id: &str) -> Result<()> {
        let (digest, _) = tree_digest(&self.require(id)?)?;
        if digest != id {
            return Err(EngineError::Storage(format!(
                "layer {} is corrupt: payload hashes to {}",
                id, digest
            )));
        }
        Ok(())
    }

    /// Store opaque bytes under a per-layer metadata key.
    pub fn set_metadata(&self, id: &str, key: &str, value: &[u8]) -> Result<()> {
        if key.is_empty() || key.contains('/') || key.contains("..") {
            return Err(EngineError::Storage(format!("invalid metadata key '{}'", key)));
        }
        let dir = self.metadata_dir(id);
        std::fs::create_dir_all(&dir)?;
        let tmp = dir.join(format!("{}.tmp", key));
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, dir.join(key))?;
        Ok(())
    }

    /// Read a per-layer metadata key.
    pub fn get_metadata(&self, id: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.metadata_dir(id).join(key);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Record the digest this layer's compressed blob carries in `registry`.
    pub fn add_distribution_digest(&self, id: &str, registry: &str, digest: &str) -> Result<()> {
        let mut map = self.distribution_digests(id)?;
        map.insert(registry.to_string(), digest.to_string());
        self.set_metadata(id, DISTRIBUTION_KEY, &serde_json::to_vec(&map)?)
    }

    /// All recorded distribution digests for a layer, keyed by registry.
    pub fn distribution_digests(&self, id: &str) -> Result<BTreeMap<String, String>> {
        match self.get_metadata(id, DISTRIBUTION_KEY)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(BTreeMap::new()),
        }
    }

    /// Remove a layer and its metadata. Explicit prune only.
    pub fn remove(&self, id: &str) -> Result<()> {
        let path = self.require(id)?;
        std::fs::remove_dir_all(&path)?;
        let meta = self.metadata_dir(id);
        if meta.exists() {
            std::fs::remove_dir_all(&meta)?;
        }
        Ok(())
    }

    /// Ids of every registered layer.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for shard_entry in std::fs::read_dir(&self.root)? {
            let shard_path = shard_entry?.path();
            if !shard_path.is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(&shard_path)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                if is_digest_hex(&name) && entry.path().is_dir() {
                    ids.push(name);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn require(&self, id: &str) -> Result<PathBuf> {
        let path = self.payload_path(id);
        if !path.is_dir() {
            return Err(EngineError::NotFound(format!("layer {}", id)));
        }
        Ok(path)
    }

    fn metadata_dir(&self, id: &str) -> PathBuf {
        self.root.join(shard(id)).join(format!("{}.metadata", id))
    }
}

fn shard(id: &str) -> &str {
    &id[..2.min(id.len())]
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let meta = std::fs::symlink_metadata(&from)?;
        if meta.is_dir() {
            copy_tree(&from, &to)?;
        } else if meta.file_type().is_symlink() {
            let target = std::fs::read_link(&from)?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(&target, &to)?;
            #[cfg(not(unix))]
            return Err(EngineError::Storage(format!(
                "cannot copy symlink {} on this platform",
                from.display()
            )));
        } else {
            std::fs::copy(&from, &to)?;
        }
    }
    Ok(())
}
