//! Default [`Saver`]: pulls embedded container images into a layer.
//!
//! Deposits each reference's manifest, config, and layer blobs under the
//! target directory as a blob store (`blobs/sha256/<hex>`) with a ref
//! file per tag, so an in-cluster registry can serve them without ever
//! reaching the outside world. Multi-platform references resolve through
//! their index to the manifest matching the build platform.

use std::path::Path;

use async_trait::async_trait;
use kubeimage_core::{CancelFlag, EngineConfig, EngineError, Platform, Result};
use serde::Deserialize;
use tracing::{debug, info};

use crate::harvest::Saver;
use crate::reference::ImageReference;
use crate::registry::auth::Credentials;
use crate::registry::client::{Descriptor, RegistryClient};

#[derive(Debug, Deserialize)]
struct IndexManifestEntry {
    digest: String,
    #[serde(default)]
    platform: Option<IndexPlatform>,
}

#[derive(Debug, Deserialize)]
struct IndexPlatform {
    architecture: String,
    os: String,
    #[serde(default)]
    variant: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImageIndex {
    manifests: Vec<IndexManifestEntry>,
}

/// Manifest shape shared by docker schema-2 and OCI image manifests.
#[derive(Debug, Deserialize)]
struct ForeignManifest {
    config: Descriptor,
    layers: Vec<Descriptor>,
}

/// Saver backed by the registry transport.
pub struct RegistrySaver {
    config: EngineConfig,
    credentials: Option<Credentials>,
    cancel: CancelFlag,
}

impl RegistrySaver {
    pub fn new(
        config: EngineConfig,
        credentials: Option<Credentials>,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            config,
            credentials,
            cancel,
        }
    }

    async fn save_one(&self, image: &str, dir: &Path, platform: &Platform) -> Result<()> {
        self.cancel.check()?;
        let reference = ImageReference::parse(image, &self.config.name_defaults)?;

        // embedded images live on public registries; the insecure toggle
        // applies only to the cluster-image registry
        let mut config = self.config.clone();
        config.insecure_registry = false;
        let client = RegistryClient::new(
            &reference.registry,
            &reference.repository,
            &config,
            self.credentials.clone(),
            self.cancel.clone(),
        )?;

        let blobs_dir = dir.join("blobs").join("sha256");
        std::fs::create_dir_all(&blobs_dir)?;

        let (mut bytes, mut digest, mut content_type) =
            client.get_manifest_raw(&reference.tag).await?;

        if content_type.contains("index") || content_type.contains("manifest.list") {
            let index: ImageIndex = serde_json::from_slice(&bytes)?;
            let selected = index
                .manifests
                .iter()
                .find(|m| {
                    m.platform.as_ref().is_some_and(|p| {
                        p.os == platform.os
                            && p.architecture == platform.arch
                            && (platform.variant.is_none() || p.variant == platform.variant)
                    })
                })
                .ok_or_else(|| EngineError::Registry {
                    registry: reference.registry.clone(),
                    message: format!("{} has no manifest for {}", image, platform),
                })?;
            let resolved = client.get_manifest_raw(&selected.digest).await?;
            bytes = resolved.0;
            digest = resolved.1;
            content_type = resolved.2;
        }
        debug!(image = %image, digest = %digest, media_type = %content_type, "resolved manifest");

        write_blob(&blobs_dir, &digest, &bytes)?;

        let manifest: ForeignManifest = serde_json::from_slice(&bytes)?;
        let config_bytes = client.get_blob_bytes(&manifest.config).await?;
        write_blob(&blobs_dir, &manifest.config.digest, &config_bytes)?;

        for layer in &manifest.layers {
            self.cancel.check()?;
            let dest = blobs_dir.join(hex_of(&layer.digest)?);
            if dest.exists() {
                continue;
            }
            client.get_blob(layer, &dest).await?;
        }

        // tag ref: refs/<registry>/<repository>/<tag> → manifest digest
        let ref_path = dir
            .join("refs")
            .join(&reference.registry)
            .join(&reference.repository)
            .join(&reference.tag);
        std::fs::create_dir_all(ref_path.parent().unwrap())?;
        std::fs::write(&ref_path, &digest)?;

        info!(image = %image, layers = manifest.layers.len(), "saved embedded image");
        Ok(())
    }
}

#[async_trait]
impl Saver for RegistrySaver {
    async fn save_images(&self, images: &[String], dir: &Path, platform: &Platform) -> Result<()> {
        let mut errors = Vec::new();
        for image in images {
            if let Err(e) = self.save_one(image, dir, platform).await {
                errors.push(e);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::aggregate(errors))
        }
    }
}

fn write_blob(blobs_dir: &Path, digest: &str, bytes: &[u8]) -> Result<()> {
    let path = blobs_dir.join(hex_of(digest)?);
    if path.exists() {
        return Ok(());
    }
    let tmp = path.with_extension("partial");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

fn hex_of(digest: &str) -> Result<&str> {
    digest
        .strip_prefix("sha256:")
        .ok_or_else(|| EngineError::Storage(format!("unsupported digest '{}'", digest)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_of() {
        assert_eq!(hex_of("sha256:abc").unwrap(), "abc");
        assert!(hex_of("md5:abc").is_err());
    }

    #[test]
    fn test_index_selection_shape() {
        let index: ImageIndex = serde_json::from_str(
            r#"{"manifests":[
                {"digest":"sha256:aaa","platform":{"architecture":"amd64","os":"linux"}},
                {"digest":"sha256:bbb","platform":{"architecture":"arm64","os":"linux","variant":"v8"}}
            ]}"#,
        )
        .unwrap();
        assert_eq!(index.manifests.len(), 2);
        assert_eq!(index.manifests[1].digest, "sha256:bbb");
        assert_eq!(
            index.manifests[1].platform.as_ref().unwrap().variant.as_deref(),
            Some("v8")
        );
    }

    #[test]
    fn test_write_blob_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        write_blob(tmp.path(), "sha256:abc", b"one").unwrap();
        write_blob(tmp.path(), "sha256:abc", b"two").unwrap();
        assert_eq!(std::fs::read(tmp.path().join("abc")).unwrap(), b"one");
    }
}
