//! `kubeimage inspect` — print an image's JSON document.

use clap::Args;
use kubeimage_core::{EngineConfig, Result};
use kubeimage_engine::ImageReference;

#[derive(Args)]
pub struct InspectArgs {
    /// Image name, e.g. "infra/k8s:v1"
    pub name: String,
}

pub async fn execute(args: InspectArgs, config: EngineConfig) -> Result<()> {
    let (_, images) = super::open_stores(&config)?;
    let reference = ImageReference::parse(&args.name, &config.name_defaults)?;
    let image = images.get_by_name(&reference, &config.platform)?;
    println!("{}", serde_json::to_string_pretty(&image)?);
    Ok(())
}
