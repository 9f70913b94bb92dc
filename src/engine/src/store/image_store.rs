//! Image manifest persistence and the name index.
//!
//! One JSON file per image id under `images/`, plus a name index
//! `refs/<name>/<tag>/<platform>` where each index entry is a text file
//! holding the image id. Retagging writes a new index entry; it never
//! creates a new image id.

use std::path::{Path, PathBuf};

use kubeimage_core::{EngineError, Platform, Result};
use tracing::debug;

use crate::image::Image;
use crate::reference::ImageReference;

/// One entry of the name index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub name: String,
    pub tag: String,
    pub platform: String,
    pub image_id: String,
}

/// Store of image JSON documents and the (name, tag, platform) index.
pub struct ImageStore {
    images_dir: PathBuf,
    refs_dir: PathBuf,
}

impl ImageStore {
    pub fn new(images_dir: impl Into<PathBuf>, refs_dir: impl Into<PathBuf>) -> Result<Self> {
        let images_dir = images_dir.into();
        let refs_dir = refs_dir.into();
        std::fs::create_dir_all(&images_dir)?;
        std::fs::create_dir_all(&refs_dir)?;
        Ok(Self {
            images_dir,
            refs_dir,
        })
    }

    /// Persist an image document. Returns the image id.
    ///
    /// The write goes through a temp file and a rename, so readers only
    /// ever observe complete documents.
    pub fn save(&self, image: &Image) -> Result<String> {
        let id = image.id()?;
        let final_path = self.image_path(&id);
        let tmp = final_path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(image)?)?;
        std::fs::rename(&tmp, &final_path)?;
        debug!(image = %id, "saved image");
        Ok(id)
    }

    pub fn get_by_id(&self, id: &str) -> Result<Image> {
        let path = self.image_path(id);
        let bytes = std::fs::read(&path)
            .map_err(|_| EngineError::NotFound(format!("image {}", id)))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Resolve a tagged name to an image id, if indexed.
    pub fn resolve(&self, reference: &ImageReference, platform: &Platform) -> Result<Option<String>> {
        let path = self.ref_path(reference, platform);
        match std::fs::read_to_string(&path) {
            Ok(id) => Ok(Some(id.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_by_name(&self, reference: &ImageReference, platform: &Platform) -> Result<Image> {
        let id = self
            .resolve(reference, platform)?
            .ok_or_else(|| EngineError::NotFound(format!("image {} ({})", reference, platform)))?;
        self.get_by_id(&id)
    }

    /// Point `(name, tag, platform)` at an existing image id.
    pub fn set_tag(&self, reference: &ImageReference, platform: &Platform, id: &str) -> Result<()> {
        if !self.image_path(id).is_file() {
            return Err(EngineError::NotFound(format!("image {}", id)));
        }
        let path = self.ref_path(reference, platform);
        std::fs::create_dir_all(path.parent().unwrap())?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, id)?;
        std::fs::rename(&tmp, &path)?;
        debug!(name = %reference, platform = %platform, image = %id, "tagged image");
        Ok(())
    }

    /// Remove one index entry. The image document stays until every tag
    /// referencing it is gone and the caller prunes it.
    pub fn delete_tag(&self, reference: &ImageReference, platform: &Platform) -> Result<()> {
        let path = self.ref_path(reference, platform);
        std::fs::remove_file(&path)
            .map_err(|_| EngineError::NotFound(format!("tag {} ({})", reference, platform)))
    }

    /// Delete an image document by id.
    pub fn remove_image(&self, id: &str) -> Result<()> {
        std::fs::remove_file(self.image_path(id))
            .map_err(|_| EngineError::NotFound(format!("image {}", id)))
    }

    /// Whether any index entry still references the image id.
    pub fn is_referenced(&self, id: &str) -> Result<bool> {
        Ok(self.list()?.iter().any(|r| r.image_id == id))
    }

    /// Every entry of the name index.
    pub fn list(&self) -> Result<Vec<ImageRecord>> {
        let mut records = Vec::new();
        walk_refs(&self.refs_dir, &self.refs_dir, &mut records)?;
        records.sort_by(|a, b| {
            (&a.name, &a.tag, &a.platform).cmp(&(&b.name, &b.tag, &b.platform))
        });
        Ok(records)
    }

    fn image_path(&self, id: &str) -> PathBuf {
        self.images_dir.join(format!("{}.json", id))
    }

    fn ref_path(&self, reference: &ImageReference, platform: &Platform) -> PathBuf {
        self.refs_dir
            .join(reference.name())
            .join(&reference.tag)
            .join(platform.dir_name())
    }
}

fn walk_refs(root: &Path, current: &Path, out: &mut Vec<ImageRecord>) -> Result<()> {
    for entry in std::fs::read_dir(current)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk_refs(root, &path, out)?;
            continue;
        }
        // refs/<name…>/<tag>/<platform>
        let platform = entry.file_name().to_string_lossy().to_string();
        let tag_dir = match path.parent() {
            Some(p) if p != root => p,
            _ => continue,
        };
        let tag = tag_dir
            .file_name()
            .map(|t| t.to_string_lossy().to_string())
            .unwrap_or_default();
        let name = match tag_dir.parent().and_then(|n| n.strip_prefix(root).ok()) {
            Some(rel) if !rel.as_os_str().is_empty() => {
                rel.to_string_lossy().replace('\\', "/")
            }
            _ => continue,
        };
        let image_id = std::fs::read_to_string(&path)?.trim().to_string();
        out.push(ImageRecord {
            name,
            tag,
            platform,
            image_id,
        });
    }
    Ok(())
}
