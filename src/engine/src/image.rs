//! The cluster-image model.
//!
//! An image is an ordered list of layer references plus the configuration
//! a build accumulates: platform, build arguments, entrypoint commands,
//! and annotations. The image id is the SHA-256 of the canonical JSON
//! encoding with layer ids inlined — a pure function of content, so two
//! identical builds produce the same id. Wall-clock data (when an image
//! was saved or pulled) lives in the store index, never in the image.

use std::collections::BTreeMap;

use kubeimage_core::{Platform, Result};
use serde::{Deserialize, Serialize};

use crate::digest::sha256_bytes;

/// Annotation key carrying the build file an image was built from.
pub const CLUSTERFILE_ANNOTATION: &str = "kubeimage.io/clusterfile";

/// Media type of a layer blob as distributed.
pub const LAYER_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// One layer reference inside an image.
///
/// `kind`/`value` record the instruction that produced the layer; `id` is
/// the layer id, empty only while the build is materialising the layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRef {
    pub kind: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Named build arguments: declared defaults and the values in effect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildArgs {
    #[serde(default)]
    pub defaults: BTreeMap<String, String>,
    #[serde(default)]
    pub current: BTreeMap<String, String>,
}

impl BuildArgs {
    /// The value set a build step sees: defaults overlaid with current.
    pub fn materialised(&self) -> BTreeMap<String, String> {
        let mut out = self.defaults.clone();
        for (k, v) in &self.current {
            out.insert(k.clone(), v.clone());
        }
        out
    }
}

/// A cluster image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub platform: PlatformSpec,
    pub layers: Vec<LayerRef>,
    #[serde(default)]
    pub args: BuildArgs,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Engine version that produced this image.
    #[serde(default)]
    pub built_by: String,
}

/// Platform embedded in the image JSON.
///
/// Identical in shape to [`kubeimage_core::Platform`]; kept as a distinct
/// serde type so the wire encoding of images is pinned here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformSpec {
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl From<&Platform> for PlatformSpec {
    fn from(p: &Platform) -> Self {
        PlatformSpec {
            os: p.os.clone(),
            arch: p.arch.clone(),
            variant: p.variant.clone(),
        }
    }
}

impl PlatformSpec {
    pub fn matches(&self, p: &Platform) -> bool {
        self.os == p.os && self.arch == p.arch && self.variant == p.variant
    }
}

impl Image {
    /// Image id: SHA-256 of the canonical JSON encoding.
    ///
    /// Map fields are `BTreeMap`s and struct field order is fixed, so the
    /// encoding (and therefore the id) is deterministic.
    pub fn id(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(sha256_bytes(&bytes))
    }

    /// Layer ids in order, skipping layers that produced none.
    pub fn layer_ids(&self) -> Vec<String> {
        self.layers
            .iter()
            .filter_map(|l| l.id.clone())
            .collect()
    }
}
