//! Instruction executors.
//!
//! `COPY` and `RUN` produce layers; `CMD` and `ARG` only touch image
//! configuration and are handled by the build engine directly. Every
//! executor probes the cache first (while the cache chain is unbroken),
//! registers its layer before the cache entry, and cleans up its scratch
//! state on the way out — except that a failed `RUN` leaves its overlay
//! mounted so a repeated build resumes in place.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use kubeimage_core::{CancelFlag, EngineError, Result};
use tracing::{debug, info, warn};

use crate::archive::path_digest;
use crate::build::cache::CacheService;
use crate::build::clusterfile::{parse_copy_value, Instruction};
use crate::digest::sha256_bytes;
use crate::harvest::Harvester;
use crate::mount::MountService;
use crate::store::{LayerStore, CACHE_ID_KEY};

/// How often a running step is polled for exit or cancellation.
const STEP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Shared state an executor needs for one step.
pub struct ExecContext {
    pub build_context: PathBuf,
    pub parent_chain_id: String,
    pub continue_cache: bool,
    pub build_args: BTreeMap<String, String>,
    /// Layer payload paths accumulated so far, oldest first.
    pub lowers: Vec<PathBuf>,
    pub layers: Arc<LayerStore>,
    pub cache: Arc<CacheService>,
    pub mounts: Arc<MountService>,
    pub harvester: Arc<Harvester>,
    pub tmp_dir: PathBuf,
    /// Per-request timeout for remote `COPY` sources.
    pub http_timeout: Duration,
    pub cancel: CancelFlag,
}

/// Result of one executed step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOut {
    pub layer_id: Option<String>,
    pub chain_id: String,
    pub continue_cache: bool,
}

/// Execute a `COPY` instruction.
pub async fn execute_copy(instruction: &Instruction, ctx: &ExecContext) -> Result<ExecOut> {
    ctx.cancel.check()?;
    let (src, dest) = parse_copy_value(&instruction.value)?;

    // remote sources have no stable tree to hash
    let source_cache_id = if is_remote_source(&src) {
        None
    } else {
        match path_digest(&ctx.build_context.join(&src)) {
            Ok(digest) => Some(digest),
            Err(e) => {
                warn!(src = %src, error = %e, "failed to hash copy source, discarding cache");
                None
            }
        }
    };

    let probe = ctx.cache.probe(
        &ctx.parent_chain_id,
        instruction,
        source_cache_id.as_deref(),
        &ctx.layers,
    );
    if ctx.continue_cache && probe.hit {
        info!(step = %instruction.value, layer = ?probe.layer_id, "using cached layer");
        return Ok(ExecOut {
            layer_id: probe.layer_id,
            chain_id: probe.chain_id,
            continue_cache: true,
        });
    }

    std::fs::create_dir_all(&ctx.tmp_dir)?;
    let staging = tempfile::tempdir_in(&ctx.tmp_dir)
        .map_err(|e| EngineError::Storage(format!("cannot create copy staging dir: {}", e)))?;

    collect_source(ctx, &src, &staging.path().join(&dest)).await?;

    // a copy into manifests/charts/the image list carries container
    // images; harvest them into the same layer before it is sealed
    if Harvester::applies_to(&dest) {
        ctx.harvester.process(staging.path()).await?;
    }

    let layer_id = ctx.layers.register(staging.path())?;
    if let Some(cache_id) = &source_cache_id {
        if let Err(e) = ctx.layers.set_metadata(&layer_id, CACHE_ID_KEY, cache_id.as_bytes()) {
            warn!(layer = %layer_id, error = %e, "failed to stamp cache id");
        }
    }
    ctx.cache.put(&probe.chain_id, &layer_id)?;

    Ok(ExecOut {
        layer_id: Some(layer_id),
        chain_id: probe.chain_id,
        continue_cache: false,
    })
}

/// Execute a `RUN` instruction.
pub async fn execute_run(instruction: &Instruction, ctx: &ExecContext) -> Result<ExecOut> {
    ctx.cancel.check()?;

    // the cache key must cover the command as it will actually run, so an
    // ARG override invalidates every step that references it
    let cmdline = expand_args(&instruction.value, &ctx.build_args);
    let command_digest = sha256_bytes(cmdline.as_bytes());

    let probe = ctx.cache.probe(
        &ctx.parent_chain_id,
        instruction,
        Some(&command_digest),
        &ctx.layers,
    );
    if ctx.continue_cache && probe.hit {
        info!(step = %instruction.value, layer = ?probe.layer_id, "using cached layer");
        return Ok(ExecOut {
            layer_id: probe.layer_id,
            chain_id: probe.chain_id,
            continue_cache: true,
        });
    }

    let handle = ctx.mounts.temp_mount(&ctx.lowers)?;
    if handle.reused {
        debug!(target = %handle.target.display(), "resuming interrupted step mount");
    }

    let target = handle.target.clone();
    let cancel = ctx.cancel.clone();
    let run_result = tokio::task::spawn_blocking(move || run_step(&cmdline, &target, &cancel))
        .await
        .map_err(|e| EngineError::Storage(format!("run worker failed: {}", e)))?;

    if let Err(e) = run_result {
        // leave the overlay mounted: a repeated build picks the same
        // lower set and resumes on this upper
        warn!(step = %instruction.value, "step failed, keeping mount for resume");
        return Err(e);
    }

    // release the overlay before the upper moves into the store
    ctx.mounts.clean_up(&handle, true)?;
    let layer_id = ctx.layers.register(&handle.upper)?;
    ctx.cache.put(&probe.chain_id, &layer_id)?;

    Ok(ExecOut {
        layer_id: Some(layer_id),
        chain_id: probe.chain_id,
        continue_cache: false,
    })
}

/// Run one build command in a subshell rooted at the mount target.
///
/// The child is polled rather than waited on, so a cancellation signal
/// kills it within one poll interval instead of blocking until it exits
/// on its own.
fn run_step(cmdline: &str, target: &Path, cancel: &CancelFlag) -> Result<()> {
    let path = match std::env::var("PATH") {
        Ok(current) => format!("{}/bin:{}", target.display(), current),
        Err(_) => format!("{}/bin", target.display()),
    };

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(cmdline)
        .current_dir(target)
        .env("PATH", path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| EngineError::Storage(format!("cannot spawn '{}': {}", cmdline, e)))?;

    // drain the pipes off-thread so a chatty step never blocks on a full
    // pipe while this thread is polling
    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let stdout_reader = std::thread::spawn(move || drain_pipe(stdout_pipe));
    let stderr_reader = std::thread::spawn(move || drain_pipe(stderr_pipe));

    // on the abort paths the reader threads are left detached: they end
    // once every holder of the pipe's write end is gone, and joining here
    // could block on a grandchild that survived the kill
    let status = loop {
        if cancel.is_cancelled() {
            child.kill().ok();
            child.wait().ok();
            return Err(EngineError::Cancelled);
        }
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => std::thread::sleep(STEP_POLL_INTERVAL),
            Err(e) => {
                child.kill().ok();
                child.wait().ok();
                return Err(EngineError::Storage(format!(
                    "cannot poll '{}': {}",
                    cmdline, e
                )));
            }
        }
    };

    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();

    if !stdout.is_empty() {
        info!("{}", String::from_utf8_lossy(&stdout).trim_end());
    }
    if !status.success() {
        return Err(EngineError::Exec {
            command: cmdline.to_string(),
            exit_code: status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&stderr).trim_end().to_string(),
        });
    }
    Ok(())
}

fn drain_pipe<R: Read>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf);
    }
    buf
}

/// Expand `${KEY}` and `$KEY` from the materialised build args.
pub fn expand_args(s: &str, args: &BTreeMap<String, String>) -> String {
    let mut result = s.to_string();
    for (key, value) in args {
        result = result.replace(&format!("${{{}}}", key), value);
        result = result.replace(&format!("${}", key), value);
    }
    result
}

/// Whether a `COPY` source is remote (http(s) or git).
pub fn is_remote_source(src: &str) -> bool {
    src.starts_with("http://")
        || src.starts_with("https://")
        || src.starts_with("git@")
        || src.ends_with(".git")
}

/// Materialise a `COPY` source under `dest_root`.
///
/// Local directories contribute their contents, local files land under
/// their own name; http(s) sources download, git sources clone.
async fn collect_source(ctx: &ExecContext, src: &str, dest_root: &Path) -> Result<()> {
    if src.starts_with("http://") || src.starts_with("https://") {
        return download_source(src, dest_root, ctx.http_timeout, &ctx.cancel).await;
    }
    if is_remote_source(src) {
        return clone_source(src, dest_root).await;
    }

    let source = ctx.build_context.join(src);
    let meta = std::fs::metadata(&source).map_err(|_| {
        EngineError::NotFound(format!(
            "copy source {} (context {})",
            src,
            ctx.build_context.display()
        ))
    })?;

    if meta.is_dir() {
        copy_contents(&source, dest_root)
    } else {
        std::fs::create_dir_all(dest_root)?;
        let name = source
            .file_name()
            .ok_or_else(|| EngineError::Storage(format!("invalid copy source '{}'", src)))?;
        std::fs::copy(&source, dest_root.join(name))?;
        Ok(())
    }
}

/// Stream a remote `COPY` source to disk, checking for cancellation
/// between chunks and honouring the configured request timeout.
async fn download_source(
    url: &str,
    dest_root: &Path,
    timeout: Duration,
    cancel: &CancelFlag,
) -> Result<()> {
    std::fs::create_dir_all(dest_root)?;
    let name = url
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .unwrap_or("download");
    let dest = dest_root.join(name);
    let partial = dest.with_extension("partial");

    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| EngineError::Storage(format!("failed to build http client: {}", e)))?;
    let response = client
        .get(url)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| EngineError::Storage(format!("download of {} failed: {}", url, e)))?;

    let mut file = std::fs::File::create(&partial)?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        if let Err(e) = cancel.check() {
            drop(file);
            std::fs::remove_file(&partial).ok();
            return Err(e);
        }
        let data = chunk
            .map_err(|e| EngineError::Storage(format!("download of {} failed: {}", url, e)))?;
        if let Err(e) = file.write_all(&data) {
            drop(file);
            std::fs::remove_file(&partial).ok();
            return Err(e.into());
        }
    }
    file.flush()?;
    drop(file);
    std::fs::rename(&partial, &dest)?;
    Ok(())
}

async fn clone_source(src: &str, dest_root: &Path) -> Result<()> {
    std::fs::create_dir_all(dest_root)?;
    let src = src.to_string();
    let dest = dest_root.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let output = Command::new("git")
            .arg("clone")
            .arg("--depth=1")
            .arg(&src)
            .current_dir(&dest)
            .output()
            .map_err(|e| EngineError::Storage(format!("cannot spawn git: {}", e)))?;
        if !output.status.success() {
            return Err(EngineError::Storage(format!(
                "git clone of {} failed: {}",
                src,
                String::from_utf8_lossy(&output.stderr).trim_end()
            )));
        }
        Ok(())
    })
    .await
    .map_err(|e| EngineError::Storage(format!("clone worker failed: {}", e)))?
}

fn copy_contents(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let meta = std::fs::symlink_metadata(&from)?;
        if meta.is_dir() {
            copy_contents(&from, &to)?;
        } else if meta.file_type().is_symlink() {
            let link = std::fs::read_link(&from)?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(&link, &to)?;
        } else {
            std::fs::copy(&from, &to)?;
        }
    }
    Ok(())
}
