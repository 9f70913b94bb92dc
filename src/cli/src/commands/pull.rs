//! `kubeimage pull` — download a cluster image from a registry.

use clap::Args;
use kubeimage_core::{EngineConfig, Result};
use kubeimage_engine::registry::Credentials;
use kubeimage_engine::{ImageReference, Puller};

#[derive(Args)]
pub struct PullArgs {
    /// Image name, e.g. "registry.example.com/infra/k8s:v1"
    pub name: String,
}

pub async fn execute(args: PullArgs, config: EngineConfig) -> Result<()> {
    let reference = ImageReference::parse(&args.name, &config.name_defaults)?;
    let (layers, images) = super::open_stores(&config)?;
    let cancel = super::cancel_on_ctrl_c();

    let puller = Puller::new(config, layers, images, Credentials::from_env(), cancel);
    let image_id = puller.pull(&reference).await?;
    println!("{}: pulled ({})", reference, image_id);
    Ok(())
}
