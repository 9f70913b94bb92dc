//! CLI command definitions and dispatch.

mod build;
mod images;
mod inspect;
mod pull;
mod push;
mod rmi;
mod tag;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use kubeimage_core::{CancelFlag, EngineConfig, EngineError, Platform, Result};
use kubeimage_engine::{ImageStore, LayerStore};

/// kubeimage — build, distribute, and store cluster images.
#[derive(Parser)]
#[command(name = "kubeimage", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Flags shared by every subcommand.
#[derive(Args)]
pub struct GlobalArgs {
    /// Store root directory (default: $KUBEIMAGE_ROOT or /var/lib/kubeimage)
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// Target platform, e.g. linux/amd64
    #[arg(long, global = true)]
    pub platform: Option<String>,

    /// Talk plain HTTP to the registry (local registries only)
    #[arg(long, global = true)]
    pub insecure_registry: bool,
}

impl GlobalArgs {
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let root = self
            .root
            .clone()
            .or_else(|| std::env::var("KUBEIMAGE_ROOT").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("/var/lib/kubeimage"));
        let mut config = EngineConfig::new(root);
        if let Some(platform) = &self.platform {
            config.platform = Platform::parse(platform)?;
        }
        config.insecure_registry = self.insecure_registry;
        Ok(config)
    }
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Build a cluster image from a Clusterfile
    Build(build::BuildArgs),
    /// Push a cluster image to a registry
    Push(push::PushArgs),
    /// Pull a cluster image from a registry
    Pull(pull::PullArgs),
    /// List stored images
    Images(images::ImagesArgs),
    /// Create a tag that refers to an existing image
    Tag(tag::TagArgs),
    /// Remove an image tag (and the image once untagged)
    Rmi(rmi::RmiArgs),
    /// Print an image's JSON document
    Inspect(inspect::InspectArgs),
}

/// Open the stores under the configured root.
pub(crate) fn open_stores(config: &EngineConfig) -> Result<(Arc<LayerStore>, Arc<ImageStore>)> {
    let layers = Arc::new(LayerStore::new(config.layers_dir(), config.tmp_dir())?);
    let images = Arc::new(ImageStore::new(config.images_dir(), config.refs_dir())?);
    Ok((layers, images))
}

/// A cancel flag wired to Ctrl-C.
pub(crate) fn cancel_on_ctrl_c() -> CancelFlag {
    let cancel = CancelFlag::new();
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling");
            flag.cancel();
        }
    });
    cancel
}

/// Dispatch a parsed CLI to the matching command handler.
pub async fn dispatch(cli: Cli) -> std::result::Result<(), EngineError> {
    let config = cli.global.engine_config()?;
    match cli.command {
        Command::Build(args) => build::execute(args, config).await,
        Command::Push(args) => push::execute(args, config).await,
        Command::Pull(args) => pull::execute(args, config).await,
        Command::Images(args) => images::execute(args, config).await,
        Command::Tag(args) => tag::execute(args, config).await,
        Command::Rmi(args) => rmi::execute(args, config).await,
        Command::Inspect(args) => inspect::execute(args, config).await,
    }
}
