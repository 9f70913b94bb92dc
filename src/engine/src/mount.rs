//! Overlay mount composition for build steps.
//!
//! A `RUN` step executes against an overlay of the layers built so far:
//! the lowers are read-only layer payloads listed oldest-first, the upper
//! is the writable directory that becomes the step's new layer. The
//! service remembers active mounts on disk, so a build interrupted inside
//! a step finds its mount again instead of mounting twice.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kubeimage_core::{EngineError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::digest::sha256_bytes;

/// Performs the actual mount syscalls. Implemented by [`OverlayMounter`]
/// in production and by in-memory fakes in tests.
pub trait Mounter: Send + Sync {
    /// Mount an overlay of `lowers` (oldest-first) with the given writable
    /// upper and work directories at `target`.
    fn mount(&self, target: &Path, upper: &Path, work: &Path, lowers: &[PathBuf]) -> Result<()>;

    /// Unmount `target`. Must be idempotent.
    fn unmount(&self, target: &Path) -> Result<()>;

    /// Whether `target` is currently mounted.
    fn is_mounted(&self, target: &Path) -> bool;
}

/// overlayfs-backed mounter.
pub struct OverlayMounter;

#[cfg(target_os = "linux")]
impl Mounter for OverlayMounter {
    fn mount(&self, target: &Path, upper: &Path, work: &Path, lowers: &[PathBuf]) -> Result<()> {
        // overlayfs lists lowerdir entries topmost-first; our API takes
        // them oldest-first, so reverse here.
        let lowerdir = lowers
            .iter()
            .rev()
            .map(|p| p.to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join(":");
        let data = format!(
            "lowerdir={},upperdir={},workdir={}",
            lowerdir,
            upper.display(),
            work.display()
        );
        nix::mount::mount(
            Some("overlay"),
            target,
            Some("overlay"),
            nix::mount::MsFlags::empty(),
            Some(data.as_str()),
        )
        .map_err(|e| {
            EngineError::Mount(format!(
                "overlay mount at {} failed: {}",
                target.display(),
                e
            ))
        })
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        match nix::mount::umount2(target, nix::mount::MntFlags::MNT_DETACH) {
            Ok(()) => Ok(()),
            // not mounted is fine, unmount is idempotent
            Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => Ok(()),
            Err(e) => Err(EngineError::Mount(format!(
                "unmount of {} failed: {}",
                target.display(),
                e
            ))),
        }
    }

    fn is_mounted(&self, target: &Path) -> bool {
        let Ok(mounts) = std::fs::read_to_string("/proc/self/mounts") else {
            return false;
        };
        let needle = target.to_string_lossy();
        mounts
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1))
            .any(|mountpoint| mountpoint == needle)
    }
}

#[cfg(not(target_os = "linux"))]
impl Mounter for OverlayMounter {
    fn mount(&self, target: &Path, _: &Path, _: &Path, _: &[PathBuf]) -> Result<()> {
        Err(EngineError::Mount(format!(
            "overlay mounts require linux (target {})",
            target.display()
        )))
    }

    fn unmount(&self, _: &Path) -> Result<()> {
        Ok(())
    }

    fn is_mounted(&self, _: &Path) -> bool {
        false
    }
}

/// An active (or resumed) overlay mount.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MountHandle {
    pub target: PathBuf,
    pub upper: PathBuf,
    pub work: PathBuf,
    pub lowers: Vec<PathBuf>,
    /// True when `temp_mount` found this mount already active.
    #[serde(skip)]
    pub reused: bool,
}

impl MountHandle {
    /// The writable directory handed to the layer store after a step.
    pub fn mount_upper(&self) -> &Path {
        &self.upper
    }
}

/// Allocates and tracks temp mounts under a root directory.
pub struct MountService {
    mounter: Arc<dyn Mounter>,
    root: PathBuf,
}

impl MountService {
    pub fn new(mounter: Arc<dyn Mounter>, root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { mounter, root })
    }

    /// Mount a fresh overlay of `lowers`, or return the recorded handle if
    /// an overlay with this exact lower list is already active.
    pub fn temp_mount(&self, lowers: &[PathBuf]) -> Result<MountHandle> {
        if lowers.is_empty() {
            return Err(EngineError::Mount("no lower layers to mount".to_string()));
        }

        let key = lower_set_key(lowers);
        let dir = self.root.join(&key);
        let record_path = dir.join("mount.json");

        if let Some(mut handle) = self.read_record(&record_path)? {
            if handle.lowers == lowers {
                if !self.mounter.is_mounted(&handle.target) {
                    // recorded but the mount itself is gone; mount again
                    self.mounter
                        .mount(&handle.target, &handle.upper, &handle.work, lowers)?;
                }
                debug!(target = %handle.target.display(), "reusing existing overlay mount");
                handle.reused = true;
                return Ok(handle);
            }
            warn!(
                record = %record_path.display(),
                "mount record does not match requested lowers, discarding"
            );
            std::fs::remove_file(&record_path)?;
        }

        let target = dir.join("merged");
        let upper = dir.join("upper");
        let work = dir.join("work");
        std::fs::create_dir_all(&target)?;
        std::fs::create_dir_all(&upper)?;
        std::fs::create_dir_all(&work)?;

        self.mounter.mount(&target, &upper, &work, lowers)?;

        let handle = MountHandle {
            target,
            upper,
            work,
            lowers: lowers.to_vec(),
            reused: false,
        };
        std::fs::write(&record_path, serde_json::to_vec_pretty(&handle)?)?;
        Ok(handle)
    }

    /// Unmount and discard a temp mount.
    ///
    /// With `keep_upper` the upper directory is left in place for the
    /// caller (the layer store usually renames it away during
    /// registration, which counts as capturing it too).
    pub fn clean_up(&self, handle: &MountHandle, keep_upper: bool) -> Result<()> {
        self.mounter.unmount(&handle.target)?;

        let dir = self.root.join(lower_set_key(&handle.lowers));
        std::fs::remove_file(dir.join("mount.json")).ok();
        remove_if_present(&handle.target)?;
        remove_if_present(&handle.work)?;
        if !keep_upper {
            remove_if_present(&handle.upper)?;
        }
        // drop the per-mount directory once it is empty
        std::fs::remove_dir(&dir).ok();
        Ok(())
    }

    fn read_record(&self, path: &Path) -> Result<Option<MountHandle>> {
        match std::fs::read(path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(handle) => Ok(Some(handle)),
                Err(e) => {
                    warn!(record = %path.display(), error = %e, "dropping unreadable mount record");
                    std::fs::remove_file(path)?;
                    Ok(None)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn lower_set_key(lowers: &[PathBuf]) -> String {
    let joined = lowers
        .iter()
        .map(|p| p.to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("\n");
    sha256_bytes(joined.as_bytes())[..16].to_string()
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Tracks mount state in memory; no syscalls.
    #[derive(Default)]
    pub(crate) struct FakeMounter {
        mounted: Mutex<HashSet<PathBuf>>,
        pub mount_calls: Mutex<usize>,
    }

    impl Mounter for FakeMounter {
        fn mount(
            &self,
            target: &Path,
            _upper: &Path,
            _work: &Path,
            _lowers: &[PathBuf],
        ) -> Result<()> {
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

    fn lowers(tmp: &TempDir, names: &[&str]) -> Vec<PathBuf> {
        names
            .iter()
            .map(|n| {
                let p = tmp.path().join(n);
                std::fs::create_dir_all(&p).unwrap();
                p
            })
            .collect()
    }

    #[test]
    fn test_temp_mount_allocates_dirs() {
        let tmp = TempDir::new().unwrap();
        let mounter = Arc::new(FakeMounter::default());
        let svc = MountService::new(mounter.clone(), tmp.path().join("mounts")).unwrap();

        let handle = svc.temp_mount(&lowers(&tmp, &["l0", "l1"])).unwrap();
        assert!(handle.target.is_dir());
        assert!(handle.upper.is_dir());
        assert!(handle.work.is_dir());
        assert!(!handle.reused);
        assert_eq!(handle.mount_upper(), handle.upper.as_path());
        assert!(mounter.is_mounted(&handle.target));
    }

    #[test]
    fn test_empty_lowers_rejected() {
        let tmp = TempDir::new().unwrap();
        let svc =
            MountService::new(Arc::new(FakeMounter::default()), tmp.path().join("mounts")).unwrap();
        assert!(matches!(svc.temp_mount(&[]), Err(EngineError::Mount(_))));
    }

    #[test]
    fn test_matching_lower_set_reused() {
        let tmp = TempDir::new().unwrap();
        let mounter = Arc::new(FakeMounter::default());
        let svc = MountService::new(mounter.clone(), tmp.path().join("mounts")).unwrap();
        let set = lowers(&tmp, &["l0", "l1"]);

        let first = svc.temp_mount(&set).unwrap();
        let second = svc.temp_mount(&set).unwrap();
        assert!(second.reused);
        assert_eq!(second.target, first.target);
        assert_eq!(second.upper, first.upper);
        // the overlay was mounted once, not twice
        assert_eq!(*mounter.mount_calls.lock().unwrap(), 1);
    }

    #[test]
    fn test_different_lower_sets_do_not_collide() {
        let tmp = TempDir::new().unwrap();
        let svc =
            MountService::new(Arc::new(FakeMounter::default()), tmp.path().join("mounts")).unwrap();

        let a = svc.temp_mount(&lowers(&tmp, &["l0"])).unwrap();
        let b = svc.temp_mount(&lowers(&tmp, &["l0", "l1"])).unwrap();
        assert_ne!(a.target, b.target);
    }

    #[test]
    fn test_lower_order_is_part_of_identity() {
        let tmp = TempDir::new().unwrap();
        let svc =
            MountService::new(Arc::new(FakeMounter::default()), tmp.path().join("mounts")).unwrap();
        let set = lowers(&tmp, &["l0", "l1"]);
        let reversed: Vec<PathBuf> = set.iter().rev().cloned().collect();

        let a = svc.temp_mount(&set).unwrap();
        let b = svc.temp_mount(&reversed).unwrap();
        assert_ne!(a.target, b.target);
    }

    #[test]
    fn test_clean_up_removes_state() {
        let tmp = TempDir::new().unwrap();
        let mounter = Arc::new(FakeMounter::default());
        let svc = MountService::new(mounter.clone(), tmp.path().join("mounts")).unwrap();
        let set = lowers(&tmp, &["l0"]);

        let handle = svc.temp_mount(&set).unwrap();
        svc.clean_up(&handle, false).unwrap();
        assert!(!mounter.is_mounted(&handle.target));
        assert!(!handle.upper.exists());
        assert!(!handle.work.exists());

        // a new temp_mount after cleanup mounts fresh
        let again = svc.temp_mount(&set).unwrap();
        assert!(!again.reused);
    }

    #[test]
    fn test_clean_up_keep_upper() {
        let tmp = TempDir::new().unwrap();
        let svc =
            MountService::new(Arc::new(FakeMounter::default()), tmp.path().join("mounts")).unwrap();

        let handle = svc.temp_mount(&lowers(&tmp, &["l0"])).unwrap();
        std::fs::write(handle.upper.join("produced"), "data").unwrap();
        svc.clean_up(&handle, true).unwrap();
        assert!(handle.upper.join("produced").is_file());
        assert!(!handle.work.exists());
    }

    #[test]
    fn test_clean_up_idempotent() {
        let tmp = TempDir::new().unwrap();
        let svc =
            MountService::new(Arc::new(FakeMounter::default()), tmp.path().join("mounts")).unwrap();
        let handle = svc.temp_mount(&lowers(&tmp, &["l0"])).unwrap();
        svc.clean_up(&handle, false).unwrap();
        svc.clean_up(&handle, false).unwrap();
    }

    #[test]
    fn test_remount_when_record_is_stale() {
        let tmp = TempDir::new().unwrap();
        let mounter = Arc::new(FakeMounter::default());
        let svc = MountService::new(mounter.clone(), tmp.path().join("mounts")).unwrap();
        let set = lowers(&tmp, &["l0"]);

        let handle = svc.temp_mount(&set).unwrap();
        // simulate a reboot: the record survives, the mount does not
        mounter.unmount(&handle.target).unwrap();

        let resumed = svc.temp_mount(&set).unwrap();
        assert!(resumed.reused);
        assert!(mounter.is_mounted(&resumed.target));
        assert_eq!(*mounter.mount_calls.lock().unwrap(), 2);
    }
}
