//! Content-addressed stores: layer payloads and image manifests.

mod image_store;
mod layer_store;

pub use image_store::{ImageRecord, ImageStore};
pub use layer_store::{Layer, LayerStore, CACHE_ID_KEY};
