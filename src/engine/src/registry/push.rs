//! Cluster-image push.
//!
//! Layers upload in parallel under a bounded semaphore. A layer whose
//! distribution digest is already known to the registry is skipped after
//! a single `HEAD`; everything else is tarred, gzip-compressed through a
//! digest tee, and uploaded chunk by chunk. The final manifest lists the
//! layer descriptors in build order regardless of upload completion
//! order.

use std::sync::Arc;

use kubeimage_core::{CancelFlag, EngineConfig, EngineError, Result};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::archive::gzip_spool;
use crate::image::LAYER_MEDIA_TYPE;
use crate::reference::ImageReference;
use crate::registry::auth::Credentials;
use crate::registry::client::{Descriptor, Manifest, RegistryClient, CONFIG_MEDIA_TYPE};
use crate::store::{ImageStore, LayerStore};

/// Capacity of the per-push error channel.
const ERROR_CHANNEL_CAPACITY: usize = 128;

/// Pushes images from the local stores to a registry.
pub struct Pusher {
    config: EngineConfig,
    layers: Arc<LayerStore>,
    images: Arc<ImageStore>,
    credentials: Option<Credentials>,
    cancel: CancelFlag,
}

impl Pusher {
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

    /// Push a tagged image. Returns the manifest digest.
    pub async fn push(&self, reference: &ImageReference) -> Result<String> {
        match self.config.transfer_budget() {
            Some(budget) => tokio::time::timeout(budget, self.push_inner(reference))
                .await
                .map_err(|_| EngineError::Registry {
                    registry: reference.registry.clone(),
                    message: format!("push budget of {:?} exceeded", budget),
                })?,
            None => self.push_inner(reference).await,
        }
    }

    async fn push_inner(&self, reference: &ImageReference) -> Result<String> {
        let image = self.images.get_by_name(reference, &self.config.platform)?;
        let layer_ids = image.layer_ids();

        // every referenced layer must exist before any byte moves
        for id in &layer_ids {
            if !self.layers.contains(id) {
                return Err(EngineError::NotFound(format!(
                    "layer {} referenced by {} is not in the local store",
                    id, reference
                )));
            }
        }

        let client = Arc::new(RegistryClient::new(
            &reference.registry,
            &reference.repository,
            &self.config,
            self.credentials.clone(),
            self.cancel.clone(),
        )?);

        info!(image = %reference, layers = layer_ids.len(), "pushing image");

        let semaphore = Arc::new(Semaphore::new(self.config.blob_concurrency.max(1)));
        let (err_tx, mut err_rx) = mpsc::channel::<EngineError>(ERROR_CHANNEL_CAPACITY);
        let mut tasks = JoinSet::new();

        for (index, layer_id) in layer_ids.iter().enumerate() {
            let client = client.clone();
            let layers = self.layers.clone();
            let semaphore = semaphore.clone();
            let err_tx = err_tx.clone();
            let cancel = self.cancel.clone();
            let layer_id = layer_id.clone();
            let spool_dir = self.config.tmp_dir();

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                match upload_layer(&client, &layers, &spool_dir, &layer_id, &cancel).await {
                    Ok(descriptor) => Some((index, descriptor)),
                    Err(e) => {
                        let _ = err_tx.try_send(e);
                        None
                    }
                }
            });
        }
        drop(err_tx);

        let mut by_index: Vec<Option<Descriptor>> = vec![None; layer_ids.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some((index, descriptor))) => by_index[index] = Some(descriptor),
                Ok(None) => {}
                Err(e) => {
                    return Err(EngineError::Registry {
                        registry: reference.registry.clone(),
                        message: format!("upload worker failed: {}", e),
                    })
                }
            }
        }

        let mut errors = Vec::new();
        while let Ok(e) = err_rx.try_recv() {
            errors.push(e);
        }
        if !errors.is_empty() {
            return Err(EngineError::aggregate(errors));
        }

        let layer_descriptors: Vec<Descriptor> = by_index.into_iter().flatten().collect();
        if layer_descriptors.len() != layer_ids.len() {
            return Err(EngineError::Registry {
                registry: reference.registry.clone(),
                message: "not every layer produced a descriptor".to_string(),
            });
        }

        // config blob: the image JSON itself
        let config_bytes = serde_json::to_vec(&image)?;
        let config_digest = format!("sha256:{}", crate::digest::sha256_bytes(&config_bytes));
        if client.blob_stat(&config_digest).await?.is_none() {
            client.upload_blob_bytes(&config_bytes, &config_digest).await?;
        }

        let manifest = Manifest::new(
            Descriptor {
                media_type: CONFIG_MEDIA_TYPE.to_string(),
                digest: config_digest,
                size: config_bytes.len() as u64,
            },
            layer_descriptors,
        );
        let manifest_digest = client.put_manifest(&reference.tag, &manifest).await?;
        info!(image = %reference, digest = %manifest_digest, "push complete");
        Ok(manifest_digest)
    }
}

/// Upload one layer, reusing any blob the registry already holds.
async fn upload_layer(
    client: &RegistryClient,
    layers: &LayerStore,
    spool_dir: &std::path::Path,
    layer_id: &str,
    cancel: &CancelFlag,
) -> Result<Descriptor> {
    cancel.check()?;

    // every distribution digest ever recorded for this layer is a
    // candidate; the current registry's entry goes first
    let recorded = layers.distribution_digests(layer_id)?;
    let mut candidates: Vec<String> = Vec::new();
    if let Some(own) = recorded.get(client.registry()) {
        candidates.push(own.clone());
    }
    for digest in recorded.values() {
        if !candidates.contains(digest) {
            candidates.push(digest.clone());
        }
    }
    for candidate in candidates {
        if let Some(size) = client.blob_stat(&candidate).await? {
            info!(layer = %layer_id, digest = %candidate, "layer already exists in registry");
            return Ok(Descriptor {
                media_type: LAYER_MEDIA_TYPE.to_string(),
                digest: candidate,
                size,
            });
        }
    }

    std::fs::create_dir_all(spool_dir)?;
    let tar_path = spool_dir.join(format!("{}.tar", layer_id));
    let gz_path = spool_dir.join(format!("{}.tar.gz", layer_id));

    let result = async {
        // tar + gzip are blocking; keep them off the async workers
        let (compressed_digest, compressed_size) = {
            let tar = tar_path.clone();
            let gz = gz_path.clone();
            let id = layer_id.to_string();
            let store = layers.clone();
            tokio::task::spawn_blocking(move || -> Result<(String, u64)> {
                store.tar_spool(&id, &tar)?;
                gzip_spool(std::fs::File::open(&tar)?, &gz)
            })
            .await
            .map_err(|e| EngineError::Storage(format!("spool worker failed: {}", e)))??
        };

        cancel.check()?;
        let digest = format!("sha256:{}", compressed_digest);
        if client.blob_stat(&digest).await?.is_none() {
            client.upload_blob_file(&gz_path, &digest).await?;
        }

        // bookkeeping is best-effort: the next push re-uploads if it is lost
        if let Err(e) = layers.add_distribution_digest(layer_id, client.registry(), &digest) {
            warn!(layer = %layer_id, error = %e, "failed to record distribution digest");
        }

        Ok(Descriptor {
            media_type: LAYER_MEDIA_TYPE.to_string(),
            digest,
            size: compressed_size,
        })
    }
    .await;

    std::fs::remove_file(&tar_path).ok();
    std::fs::remove_file(&gz_path).ok();
    result
}
