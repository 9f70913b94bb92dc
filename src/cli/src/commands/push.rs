//! `kubeimage push` — upload a cluster image to a registry.

use clap::Args;
use kubeimage_core::{EngineConfig, Result};
use kubeimage_engine::registry::Credentials;
use kubeimage_engine::{ImageReference, Pusher};

#[derive(Args)]
pub struct PushArgs {
    /// Image name, e.g. "registry.example.com/infra/k8s:v1"
    pub name: String,
}

pub async fn execute(args: PushArgs, config: EngineConfig) -> Result<()> {
    let reference = ImageReference::parse(&args.name, &config.name_defaults)?;
    let (layers, images) = super::open_stores(&config)?;
    let cancel = super::cancel_on_ctrl_c();

    let pusher = Pusher::new(config, layers, images, Credentials::from_env(), cancel);
    let digest = pusher.push(&reference).await?;
    println!("{}: pushed ({})", reference, digest);
    Ok(())
}
