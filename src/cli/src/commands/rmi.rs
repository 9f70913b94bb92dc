//! `kubeimage rmi` — remove an image tag, and the image document once no
//! tag references it. Layer payloads are never collected implicitly.

use clap::Args;
use kubeimage_core::{EngineConfig, Result};
use kubeimage_engine::ImageReference;

#[derive(Args)]
pub struct RmiArgs {
    /// Image name, e.g. "infra/k8s:v1"
    pub name: String,
}

pub async fn execute(args: RmiArgs, config: EngineConfig) -> Result<()> {
    let (_, images) = super::open_stores(&config)?;
    let reference = ImageReference::parse(&args.name, &config.name_defaults)?;

    let image_id = images.resolve(&reference, &config.platform)?;
    images.delete_tag(&reference, &config.platform)?;
    println!("Untagged: {}", reference);

    if let Some(id) = image_id {
        if !images.is_referenced(&id)? {
            images.remove_image(&id)?;
            println!("Deleted: {}", &id[..12]);
        }
    }
    Ok(())
}
