//! `kubeimage build` — build a cluster image from a Clusterfile.

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::Args;
use kubeimage_core::{EngineConfig, EngineError, Result};
use kubeimage_engine::{BuildEngine, BuildRequest};

#[derive(Args)]
pub struct BuildArgs {
    /// Build context directory
    #[arg(default_value = ".")]
    pub path: String,

    /// Name and tag for the image (e.g. "infra/k8s:v1")
    #[arg(short = 't', long = "tag")]
    pub tag: Option<String>,

    /// Path to the build file (default: <PATH>/Clusterfile)
    #[arg(short = 'f', long = "file")]
    pub file: Option<String>,

    /// Set build-time variables (KEY=VALUE), repeatable
    #[arg(long = "build-arg")]
    pub build_arg: Vec<String>,

    /// Suppress per-step output
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: BuildArgs, config: EngineConfig) -> Result<()> {
    let context_dir = PathBuf::from(&args.path).canonicalize().map_err(|e| {
        EngineError::Storage(format!("invalid build context '{}': {}", args.path, e))
    })?;

    let clusterfile_path = match &args.file {
        Some(f) => {
            let p = PathBuf::from(f);
            if p.is_absolute() {
                p
            } else {
                context_dir.join(p)
            }
        }
        None => context_dir.join("Clusterfile"),
    };

    let mut build_args = BTreeMap::new();
    for pair in &args.build_arg {
        let (key, value) = pair.split_once('=').ok_or_else(|| EngineError::Parse {
            line: 0,
            message: format!("invalid --build-arg '{}': expected KEY=VALUE", pair),
        })?;
        build_args.insert(key.to_string(), value.to_string());
    }

    let cancel = super::cancel_on_ctrl_c();
    let engine = BuildEngine::open(config, cancel)?;
    let outcome = engine
        .build(&BuildRequest {
            context_dir,
            clusterfile_path,
            tag: args.tag,
            build_args,
            quiet: args.quiet,
        })
        .await?;

    if args.quiet {
        println!("{}", outcome.image_id);
    }
    Ok(())
}
