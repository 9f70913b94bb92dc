//! `kubeimage images` — list stored images.

use clap::Args;
use kubeimage_core::{EngineConfig, Result};

#[derive(Args)]
pub struct ImagesArgs {
    /// Only print image ids
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: ImagesArgs, config: EngineConfig) -> Result<()> {
    let (_, images) = super::open_stores(&config)?;
    let records = images.list()?;

    if args.quiet {
        let mut seen = std::collections::BTreeSet::new();
        for record in records {
            if seen.insert(record.image_id.clone()) {
                println!("{}", record.image_id);
            }
        }
        return Ok(());
    }

    println!("{:<48} {:<16} {:<14} {}", "NAME", "TAG", "PLATFORM", "IMAGE ID");
    for record in records {
        println!(
            "{:<48} {:<16} {:<14} {}",
            record.name,
            record.tag,
            record.platform,
            &record.image_id[..12.min(record.image_id.len())]
        );
    }
    Ok(())
}
