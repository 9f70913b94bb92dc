//! `kubeimage tag` — add a name to an existing image.

use clap::Args;
use kubeimage_core::{EngineConfig, EngineError, Result};
use kubeimage_engine::ImageReference;

#[derive(Args)]
pub struct TagArgs {
    /// Existing image name or id prefix
    pub source: String,
    /// New name, e.g. "registry.example.com/infra/k8s:v2"
    pub target: String,
}

pub async fn execute(args: TagArgs, config: EngineConfig) -> Result<()> {
    let (_, images) = super::open_stores(&config)?;

    // the source may be a tagged name or an image id prefix
    let source_ref = ImageReference::parse(&args.source, &config.name_defaults)?;
    let image_id = match images.resolve(&source_ref, &config.platform)? {
        Some(id) => id,
        None => {
            let matches: Vec<String> = images
                .list()?
                .into_iter()
                .map(|r| r.image_id)
                .filter(|id| id.starts_with(&args.source))
                .collect();
            match matches.as_slice() {
                [id] => id.clone(),
                [] => return Err(EngineError::NotFound(format!("image {}", args.source))),
                _ => {
                    return Err(EngineError::NotFound(format!(
                        "image id prefix '{}' is ambiguous",
                        args.source
                    )))
                }
            }
        }
    };

    let target_ref = ImageReference::parse(&args.target, &config.name_defaults)?;
    images.set_tag(&target_ref, &config.platform, &image_id)?;
    println!("{} -> {}", target_ref, &image_id[..12]);
    Ok(())
}
