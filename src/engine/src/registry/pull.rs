//! Cluster-image pull.
//!
//! Symmetric to push: fetch the manifest by tag, fetch the config (the
//! image JSON), then fetch the layer blobs in parallel. Every blob is
//! verified twice — the compressed stream against the manifest
//! descriptor, and the registered layer id against the id the config
//! declares — before the image becomes visible locally.

use std::sync::Arc;

use kubeimage_core::{CancelFlag, EngineConfig, EngineError, Platform, Result};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::archive::unpack_tar_gz;
use crate::image::Image;
use crate::reference::ImageReference;
use crate::registry::auth::Credentials;
use crate::registry::client::{Descriptor, RegistryClient};
use crate::store::{ImageStore, LayerStore};

const ERROR_CHANNEL_CAPACITY: usize = 128;

/// Pulls images from a registry into the local stores.
pub struct Puller {
    config: EngineConfig,
    layers: Arc<LayerStore>,
    images: Arc<ImageStore>,
    credentials: Option<Credentials>,
    cancel: CancelFlag,
}

impl Puller {
    pub fn new(
        config: EngineConfig,
        layers: Arc<LayerStore>,
        images: Arc<ImageStore>,
        credentials: Option<Credentials>,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            config,
            layers,
            images,
            credentials,
            cancel,
        }
    }

    /// Pull a tagged image. Returns the image id.
    pub async fn pull(&self, reference: &ImageReference) -> Result<String> {
        match self.config.transfer_budget() {
            Some(budget) => tokio::time::timeout(budget, self.pull_inner(reference))
                .await
                .map_err(|_| EngineError::Registry {
                    registry: reference.registry.clone(),
                    message: format!("pull budget of {:?} exceeded", budget),
                })?,
            None => self.pull_inner(reference).await,
        }
    }

    async fn pull_inner(&self, reference: &ImageReference) -> Result<String> {
        let client = Arc::new(RegistryClient::new(
            &reference.registry,
            &reference.repository,
            &self.config,
            self.credentials.clone(),
            self.cancel.clone(),
        )?);

        let manifest = client.get_manifest(&reference.tag).await?;
        let config_bytes = client.get_blob_bytes(&manifest.config).await?;
        let image: Image = serde_json::from_slice(&config_bytes)?;

        let expected_ids = image.layer_ids();
        if expected_ids.len() != manifest.layers.len() {
            return Err(EngineError::Registry {
                registry: reference.registry.clone(),
                message: format!(
                    "manifest lists {} layers but the image config names {}",
                    manifest.layers.len(),
                    expected_ids.len()
                ),
            });
        }

        info!(image = %reference, layers = expected_ids.len(), "pulling image");

        let semaphore = Arc::new(Semaphore::new(self.config.blob_concurrency.max(1)));
        let (err_tx, mut err_rx) = mpsc::channel::<EngineError>(ERROR_CHANNEL_CAPACITY);
        let mut tasks = JoinSet::new();

        for (descriptor, expected_id) in manifest.layers.iter().zip(expected_ids.iter()) {
            if self.layers.contains(expected_id) {
                debug!(layer = %expected_id, "layer already present, skipping download");
                continue;
            }
            let client = client.clone();
            let layers = self.layers.clone();
            let semaphore = semaphore.clone();
            let err_tx = err_tx.clone();
            let cancel = self.cancel.clone();
            let descriptor = descriptor.clone();
            let expected_id = expected_id.clone();
            let tmp_dir = self.config.tmp_dir();

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                if let Err(e) =
                    fetch_layer(&client, &layers, &tmp_dir, &descriptor, &expected_id, &cancel)
                        .await
                {
                    let _ = err_tx.try_send(e);
                }
            });
        }
        drop(err_tx);

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                return Err(EngineError::Registry {
                    registry: reference.registry.clone(),
                    message: format!("download worker failed: {}", e),
                });
            }
        }
        let mut errors = Vec::new();
        while let Ok(e) = err_rx.try_recv() {
            errors.push(e);
        }
        if !errors.is_empty() {
            return Err(EngineError::aggregate(errors));
        }

        // commit: image document first, then the tag, under the platform
        // the image itself declares
        let image_id = self.images.save(&image)?;
        let platform = Platform {
            os: image.platform.os.clone(),
            arch: image.platform.arch.clone(),
            variant: image.platform.variant.clone(),
        };
        self.images.set_tag(reference, &platform, &image_id)?;

        info!(image = %reference, id = %image_id, "pull complete");
        Ok(image_id)
    }
}

/// Download, verify, decompress, and register one layer.
async fn fetch_layer(
    client: &RegistryClient,
    layers: &LayerStore,
    tmp_dir: &std::path::Path,
    descriptor: &Descriptor,
    expected_id: &str,
    cancel: &CancelFlag,
) -> Result<()> {
    cancel.check()?;
    std::fs::create_dir_all(tmp_dir)?;

    let blob_path = tmp_dir.join(format!("{}.tar.gz", expected_id));
    let unpack_dir = tmp_dir.join(format!("{}.unpack", expected_id));

    // compressed digest and size are verified by the transfer itself
    let result = async {
        client.get_blob(descriptor, &blob_path).await?;
        cancel.check()?;

        let blob = blob_path.clone();
        let dir = unpack_dir.clone();
        let store = layers.clone();
        let expected = expected_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            if dir.exists() {
                std::fs::remove_dir_all(&dir)?;
            }
            unpack_tar_gz(std::fs::File::open(&blob)?, &dir)?;
            let registered = store.register(&dir)?;
            if registered != expected {
                store.remove(&registered).ok();
                return Err(EngineError::Storage(format!(
                    "layer blob decompressed to {} but the image config expects {}",
                    registered, expected
                )));
            }
            Ok(())
        })
        .await
        .map_err(|e| EngineError::Storage(format!("unpack worker failed: {}", e)))??;

        if let Err(e) =
            layers.add_distribution_digest(expected_id, client.registry(), &descriptor.digest)
        {
            warn!(layer = %expected_id, error = %e, "failed to record distribution digest");
        }
        Ok(())
    }
    .await;

    std::fs::remove_file(&blob_path).ok();
    if unpack_dir.exists() {
        std::fs::remove_dir_all(&unpack_dir).ok();
    }
    result
}
