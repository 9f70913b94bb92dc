//! Build orchestration.
//!
//! Parses the Clusterfile, resolves the base image, walks the
//! instructions in order, and assembles the final image. The cache chain
//! is seeded from the base image's layer ids and extended per
//! instruction; the first miss stops all later probing, so a build is
//! one deterministic sequence of layer registrations.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use kubeimage_core::{CancelFlag, EngineConfig, EngineError, Result};
use tracing::info;

use crate::build::cache::CacheService;
use crate::build::clusterfile::{parse_arg_pairs, parse_cmd_list, Clusterfile, InstructionKind};
use crate::build::instruction::{execute_copy, execute_run, ExecContext};
use crate::digest::chain_of;
use crate::harvest::{Harvester, Saver};
use crate::image::{BuildArgs, Image, LayerRef, CLUSTERFILE_ANNOTATION};
use crate::mount::{Mounter, MountService, OverlayMounter};
use crate::reference::ImageReference;
use crate::registry::{Credentials, Puller, RegistrySaver};
use crate::store::{ImageStore, LayerStore};

/// Base name that starts a build from an empty rootfs.
const SCRATCH: &str = "scratch";

/// One build invocation.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Directory the Clusterfile's relative sources resolve against.
    pub context_dir: PathBuf,
    /// Path to the build file.
    pub clusterfile_path: PathBuf,
    /// Name to tag the result with, e.g. `infra/k8s:v1`.
    pub tag: Option<String>,
    /// `ARG` overrides from the command line.
    pub build_args: BTreeMap<String, String>,
    /// Suppress per-step output.
    pub quiet: bool,
}

/// Result of a successful build.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub image_id: String,
    pub layer_count: usize,
}

/// The cluster-image build engine.
pub struct BuildEngine {
    config: EngineConfig,
    layers: Arc<LayerStore>,
    images: Arc<ImageStore>,
    cache: Arc<CacheService>,
    mounts: Arc<MountService>,
    harvester: Arc<Harvester>,
    credentials: Option<Credentials>,
    cancel: CancelFlag,
}

impl BuildEngine {
    /// Wire an engine from explicit collaborators. Tests pass fakes for
    /// the mounter and saver; nothing global is consulted.
    pub fn new(
        config: EngineConfig,
        mounter: Arc<dyn Mounter>,
        saver: Arc<dyn Saver>,
        credentials: Option<Credentials>,
        cancel: CancelFlag,
    ) -> Result<Self> {
        let layers = Arc::new(LayerStore::new(config.layers_dir(), config.tmp_dir())?);
        let images = Arc::new(ImageStore::new(config.images_dir(), config.refs_dir())?);
        let cache = Arc::new(CacheService::open(config.cache_dir())?);
        let mounts = Arc::new(MountService::new(mounter, config.mounts_dir())?);
        let harvester = Arc::new(Harvester::new(saver, config.platform.clone()));
        Ok(Self {
            config,
            layers,
            images,
            cache,
            mounts,
            harvester,
            credentials,
            cancel,
        })
    }

    /// Production wiring: overlayfs mounts, registry-backed saver, and
    /// credentials from the environment.
    pub fn open(config: EngineConfig, cancel: CancelFlag) -> Result<Self> {
        let credentials = Credentials::from_env();
        let saver = Arc::new(RegistrySaver::new(
            config.clone(),
            credentials.clone(),
            cancel.clone(),
        ));
        Self::new(
            config,
            Arc::new(OverlayMounter),
            saver,
            credentials,
            cancel,
        )
    }

    pub fn layers(&self) -> Arc<LayerStore> {
        self.layers.clone()
    }

    pub fn images(&self) -> Arc<ImageStore> {
        self.images.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run a build to completion.
    pub async fn build(&self, request: &BuildRequest) -> Result<BuildOutcome> {
        let content =
            std::fs::read_to_string(&request.clusterfile_path).map_err(|e| EngineError::Parse {
                line: 0,
                message: format!(
                    "cannot read build file {}: {}",
                    request.clusterfile_path.display(),
                    e
                ),
            })?;
        let clusterfile = Clusterfile::parse(&content)?;
        let total = clusterfile.instructions.len();

        // FROM: the parser guarantees it is first
        let base_name = clusterfile.instructions[0].value.clone();
        if !request.quiet {
            println!("Step 1/{}: FROM {}", total, base_name);
        }
        let base = self.resolve_base(&base_name).await?;

        let mut layer_refs: Vec<LayerRef> = Vec::new();
        let mut arg_defaults: BTreeMap<String, String> = BTreeMap::new();
        let mut cmd: Vec<String> = Vec::new();
        let mut annotations: BTreeMap<String, String> = BTreeMap::new();
        let mut lowers: Vec<PathBuf> = Vec::new();

        if let Some(base) = &base {
            layer_refs = base.layers.clone();
            arg_defaults = base.args.defaults.clone();
            cmd = base.cmd.clone();
            annotations = base.annotations.clone();
            for id in base.layer_ids() {
                if !self.layers.contains(&id) {
                    return Err(EngineError::CacheInconsistency(format!(
                        "base image references layer {} which is not in the local store",
                        id
                    )));
                }
                lowers.push(self.layers.payload_path(&id));
            }
        }

        // the cache chain starts at the base image's layer chain
        let mut chain_id = chain_of(&layer_refs.iter().filter_map(|l| l.id.clone()).collect::<Vec<_>>());
        let mut continue_cache = true;

        // a scratch build still needs one lower to compose a RUN mount
        let scratch_lower = self.config.tmp_dir().join("scratch");
        std::fs::create_dir_all(&scratch_lower)?;

        for (idx, instruction) in clusterfile.instructions.iter().enumerate().skip(1) {
            self.cancel.check()?;
            let step = idx + 1;
            if !request.quiet {
                println!("Step {}/{}: {} {}", step, total, instruction.kind, instruction.value);
            }

            match instruction.kind {
                InstructionKind::From => {
                    return Err(EngineError::Parse {
                        line: 0,
                        message: "multiple FROM instructions are not supported".to_string(),
                    });
                }
                InstructionKind::Arg => {
                    for (key, value) in parse_arg_pairs(&instruction.value)? {
                        arg_defaults.insert(key, value);
                    }
                }
                InstructionKind::Cmd => {
                    cmd.extend(parse_cmd_list(&instruction.value));
                }
                InstructionKind::Copy | InstructionKind::Run => {
                    let args = BuildArgs {
                        defaults: arg_defaults.clone(),
                        current: request.build_args.clone(),
                    };
                    let ctx = ExecContext {
                        build_context: request.context_dir.clone(),
                        parent_chain_id: chain_id.clone(),
                        continue_cache,
                        build_args: args.materialised(),
                        lowers: if lowers.is_empty() {
                            vec![scratch_lower.clone()]
                        } else {
                            lowers.clone()
                        },
                        layers: self.layers.clone(),
                        cache: self.cache.clone(),
                        mounts: self.mounts.clone(),
                        harvester: self.harvester.clone(),
                        tmp_dir: self.config.tmp_dir(),
                        http_timeout: self.config.registry_timeout(),
                        cancel: self.cancel.clone(),
                    };

                    let out = if instruction.kind == InstructionKind::Copy {
                        execute_copy(instruction, &ctx).await?
                    } else {
                        execute_run(instruction, &ctx).await?
                    };

                    chain_id = out.chain_id;
                    continue_cache = out.continue_cache;
                    if let Some(layer_id) = out.layer_id {
                        lowers.push(self.layers.payload_path(&layer_id));
                        layer_refs.push(LayerRef {
                            kind: instruction.kind.as_str().to_string(),
                            value: instruction.value.clone(),
                            id: Some(layer_id),
                        });
                    }
                }
            }
        }

        annotations.insert(CLUSTERFILE_ANNOTATION.to_string(), content);

        let image = Image {
            platform: (&self.config.platform).into(),
            layers: layer_refs,
            args: BuildArgs {
                defaults: arg_defaults,
                current: request.build_args.clone(),
            },
            cmd,
            annotations,
            built_by: env!("CARGO_PKG_VERSION").to_string(),
        };

        let image_id = self.images.save(&image)?;
        if let Some(tag) = &request.tag {
            let reference = ImageReference::parse(tag, &self.config.name_defaults)?;
            self.images
                .set_tag(&reference, &self.config.platform, &image_id)?;
        }

        info!(image = %image_id, layers = image.layers.len(), "build complete");
        if !request.quiet {
            println!("Successfully built {}", image_id);
        }
        Ok(BuildOutcome {
            layer_count: image.layers.len(),
            image_id,
        })
    }

    /// Resolve the `FROM` base: `scratch`, a locally indexed image, or a
    /// registry pull.
    async fn resolve_base(&self, name: &str) -> Result<Option<Image>> {
        if name == SCRATCH {
            return Ok(None);
        }
        let reference = ImageReference::parse(name, &self.config.name_defaults)?;
        if let Some(id) = self.images.resolve(&reference, &self.config.platform)? {
            return Ok(Some(self.images.get_by_id(&id)?));
        }

        info!(base = %reference, "base image not in local store, pulling");
        let puller = Puller::new(
            self.config.clone(),
            self.layers.clone(),
            self.images.clone(),
            self.credentials.clone(),
            self.cancel.clone(),
        );
        let id = puller.pull(&reference).await?;
        Ok(Some(self.images.get_by_id(&id)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::Saver;
    use crate::mount::Mounter;
    use async_trait::async_trait;
    use kubeimage_core::Platform;
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeMounter {
        mounted: Mutex<HashSet<PathBuf>>,
        mount_calls: Mutex<usize>,
    }

    impl Mounter for FakeMounter {
        fn mount(&self, target: &Path, _: &Path, _: &Path, _: &[PathBuf]) -> Result<()> {
            *self.mount_calls.lock().unwrap() += 1;
            self.mounted.lock().unwrap().insert(target.to_path_buf());
            Ok(())
        }

        fn unmount(&self, target: &Path) -> Result<()> {
            self.mounted.lock().unwrap().remove(target);
            Ok(())
        }

        fn is_mounted(&self, target: &Path) -> bool {
            self.mounted.lock().unwrap().contains(target)
        }
    }

    struct NullSaver;

    #[async_trait]
    impl Saver for NullSaver {
        async fn save_images(&self, images: &[String], dir: &Path, _: &Platform) -> Result<()> {
            std::fs::create_dir_all(dir)?;
            std::fs::write(dir.join("imageSet"), images.join("\n"))?;
            Ok(())
        }
    }

    struct Fixture {
        tmp: TempDir,
        engine: BuildEngine,
        mounter: Arc<FakeMounter>,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let mut config = EngineConfig::new(tmp.path().join("store"));
        config.platform = Platform::parse("linux/amd64").unwrap();
        let mounter = Arc::new(FakeMounter::default());
        let engine = BuildEngine::new(
            config,
            mounter.clone(),
            Arc::new(NullSaver),
            None,
            CancelFlag::new(),
        )
        .unwrap();
        Fixture {
            tmp,
            engine,
            mounter,
        }
    }

    fn write_context(tmp: &TempDir, clusterfile: &str, files: &[(&str, &str)]) -> BuildRequest {
        let context = tmp.path().join("context");
        std::fs::create_dir_all(&context).unwrap();
        for (rel, content) in files {
            let path = context.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, content).unwrap();
        }
        let path = context.join("Clusterfile");
        std::fs::write(&path, clusterfile).unwrap();
        BuildRequest {
            context_dir: context,
            clusterfile_path: path,
            tag: None,
            build_args: BTreeMap::new(),
            quiet: true,
        }
    }

    #[tokio::test]
    async fn test_minimal_build() {
        let f = fixture();
        let mut request = write_context(
            &f.tmp,
            "FROM scratch\nCOPY charts charts\n",
            &[("charts/app/Chart.yaml", "name: app\n")],
        );
        request.tag = Some("infra/k8s:v1".to_string());

        let outcome = f.engine.build(&request).await.unwrap();
        assert_eq!(outcome.layer_count, 1);

        let reference =
            ImageReference::parse("infra/k8s:v1", &f.engine.config().name_defaults).unwrap();
        let image = f
            .engine
            .images()
            .get_by_name(&reference, &f.engine.config().platform)
            .unwrap();
        assert_eq!(image.id().unwrap(), outcome.image_id);
        assert_eq!(image.layers[0].kind, "COPY");
        assert!(image
            .annotations
            .get(CLUSTERFILE_ANNOTATION)
            .unwrap()
            .contains("FROM scratch"));
    }

    #[tokio::test]
    async fn test_build_is_deterministic_across_clean_stores() {
        let files: &[(&str, &str)] = &[("manifests/a.yaml", "spec:\n  containers:\n  - image: nginx:1.19\n")];
        let clusterfile = "FROM scratch\nCOPY manifests manifests\nCMD kubectl apply -f manifests\n";

        let f1 = fixture();
        let r1 = write_context(&f1.tmp, clusterfile, files);
        let id1 = f1.engine.build(&r1).await.unwrap().image_id;

        let f2 = fixture();
        let r2 = write_context(&f2.tmp, clusterfile, files);
        let id2 = f2.engine.build(&r2).await.unwrap().image_id;

        assert_eq!(id1, id2);
    }

    #[tokio::test]
    async fn test_second_build_hits_cache_everywhere() {
        let f = fixture();
        let request = write_context(
            &f.tmp,
            "FROM scratch\nCOPY etc etc\nRUN echo ready > ../upper/ready\n",
            &[("etc/conf", "v=1\n")],
        );

        let first = f.engine.build(&request).await.unwrap();
        let mounts_after_first = *f.mounter.mount_calls.lock().unwrap();

        let second = f.engine.build(&request).await.unwrap();
        assert_eq!(second.image_id, first.image_id);
        // the RUN step was answered from cache: no new mounts
        assert_eq!(*f.mounter.mount_calls.lock().unwrap(), mounts_after_first);
    }

    #[tokio::test]
    async fn test_copy_mutation_invalidates_suffix() {
        let f = fixture();
        let request = write_context(
            &f.tmp,
            "FROM scratch\nCOPY etc etc\nRUN echo ready > ../upper/ready\n",
            &[("etc/conf", "v=1\n")],
        );
        let first = f.engine.build(&request).await.unwrap();
        let mounts_after_first = *f.mounter.mount_calls.lock().unwrap();

        // one byte changes: the COPY layer and everything after rebuild
        std::fs::write(request.context_dir.join("etc/conf"), "v=2\n").unwrap();
        let second = f.engine.build(&request).await.unwrap();
        assert_ne!(second.image_id, first.image_id);
        assert!(*f.mounter.mount_calls.lock().unwrap() > mounts_after_first);
    }

    #[tokio::test]
    async fn test_arg_expansion_and_override() {
        let f = fixture();
        let request = write_context(
            &f.tmp,
            "FROM scratch\nARG Version=1.0\nRUN echo ${Version} > ../upper/ver\n",
            &[],
        );

        let outcome = f.engine.build(&request).await.unwrap();
        let image = f.engine.images().get_by_id(&outcome.image_id).unwrap();
        let run_layer = image.layers.last().unwrap().id.clone().unwrap();
        let ver = std::fs::read_to_string(
            f.engine.layers().payload_path(&run_layer).join("ver"),
        )
        .unwrap();
        assert_eq!(ver, "1.0\n");

        // overriding the ARG changes the produced layer
        let mut overridden = request.clone();
        overridden
            .build_args
            .insert("Version".to_string(), "2.0".to_string());
        let second = f.engine.build(&overridden).await.unwrap();
        let image2 = f.engine.images().get_by_id(&second.image_id).unwrap();
        assert_ne!(image2.layers.last().unwrap().id, image.layers.last().unwrap().id);
    }

    #[tokio::test]
    async fn test_cmd_appends_to_inherited() {
        let f = fixture();
        // base image with a CMD
        let mut base_request = write_context(
            &f.tmp,
            "FROM scratch\nCOPY etc etc\nCMD kubectl apply -f manifests\n",
            &[("etc/conf", "v=1\n")],
        );
        base_request.tag = Some("base:v1".to_string());
        f.engine.build(&base_request).await.unwrap();

        // child appends
        let child_context = f.tmp.path().join("child");
        std::fs::create_dir_all(&child_context).unwrap();
        let child_path = child_context.join("Clusterfile");
        std::fs::write(&child_path, "FROM base:v1\nCMD helm install app charts/app\n").unwrap();
        let child_request = BuildRequest {
            context_dir: child_context,
            clusterfile_path: child_path,
            tag: None,
            build_args: BTreeMap::new(),
            quiet: true,
        };

        let outcome = f.engine.build(&child_request).await.unwrap();
        let image = f.engine.images().get_by_id(&outcome.image_id).unwrap();
        assert_eq!(
            image.cmd,
            vec![
                "kubectl apply -f manifests".to_string(),
                "helm install app charts/app".to_string(),
            ]
        );
        // the base's COPY layer carried over
        assert_eq!(image.layers.len(), 1);
        assert_eq!(image.layers[0].kind, "COPY");
    }

    #[tokio::test]
    async fn test_base_layers_prefix_child_layers() {
        let f = fixture();
        let mut base_request = write_context(
            &f.tmp,
            "FROM scratch\nCOPY etc etc\n",
            &[("etc/conf", "v=1\n")],
        );
        base_request.tag = Some("base:v1".to_string());
        let base_outcome = f.engine.build(&base_request).await.unwrap();
        let base_image = f.engine.images().get_by_id(&base_outcome.image_id).unwrap();

        let child_context = f.tmp.path().join("child");
        std::fs::create_dir_all(child_context.join("bin")).unwrap();
        std::fs::write(child_context.join("bin/tool"), "#!/bin/sh\n").unwrap();
        let child_path = child_context.join("Clusterfile");
        std::fs::write(&child_path, "FROM base:v1\nCOPY bin bin\n").unwrap();
        let child_request = BuildRequest {
            context_dir: child_context,
            clusterfile_path: child_path,
            tag: None,
            build_args: BTreeMap::new(),
            quiet: true,
        };

        let outcome = f.engine.build(&child_request).await.unwrap();
        let image = f.engine.images().get_by_id(&outcome.image_id).unwrap();
        assert_eq!(image.layers.len(), 2);
        assert_eq!(image.layers[0].id, base_image.layers[0].id);
        assert_eq!(image.layers[1].kind, "COPY");
    }

    #[tokio::test]
    async fn test_multiple_from_rejected() {
        let f = fixture();
        let request = write_context(&f.tmp, "FROM scratch\nFROM scratch\n", &[]);
        assert!(matches!(
            f.engine.build(&request).await,
            Err(EngineError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_run_then_resume() {
        let f = fixture();
        let request = write_context(
            &f.tmp,
            "FROM scratch\nRUN test -f ../upper/flag && echo ok > ../upper/done\n",
            &[],
        );

        // first attempt fails; the mount must survive for resume
        let err = f.engine.build(&request).await.unwrap_err();
        assert!(matches!(err, EngineError::Exec { .. }));

        // drop the flag into the surviving upper, then resume
        let mounts_dir = f.engine.config().mounts_dir();
        let upper = std::fs::read_dir(&mounts_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path().join("upper"))
            .find(|p| p.is_dir())
            .expect("upper dir survives the failed step");
        std::fs::write(upper.join("flag"), "1").unwrap();

        let outcome = f.engine.build(&request).await.unwrap();
        let image = f.engine.images().get_by_id(&outcome.image_id).unwrap();
        let layer = image.layers.last().unwrap().id.clone().unwrap();
        assert!(f
            .engine
            .layers()
            .payload_path(&layer)
            .join("done")
            .is_file());
    }

    #[tokio::test]
    async fn test_build_error_carries_exit_code_two() {
        let f = fixture();
        let request = write_context(&f.tmp, "FROM scratch\nBADCMD x\n", &[]);
        let err = f.engine.build(&request).await.unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
