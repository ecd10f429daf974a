// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{path::PathBuf, sync::Arc};

use serde_json::{json, Value};

use crate::{
    engine::{
        backend::Backend,
        consts::LOCK_ID,
        device,
        image::{image_exists, provision},
        lock,
        names::parse_volume_spec,
        registry::VolumeRegistry,
        rollback::{Rollback, StrandedLedger},
        types::{DriverConfig, Resource, StrandedResource, VolumeSpec, VolumeState},
    },
    rbdvol::{ErrorEnum, RbdVolError, RbdVolResult},
};

/// Sequences the lifecycle of volumes on this host.
///
/// The registry is the only local record of which volumes are live; the
/// cluster lock on each image is the only coordination with other hosts.
#[derive(Debug)]
pub struct VolumeEngine {
    config: DriverConfig,
    backend: Arc<dyn Backend>,
    registry: VolumeRegistry,
    stranded: StrandedLedger,
}

impl VolumeEngine {
    pub fn new(config: DriverConfig, backend: Arc<dyn Backend>) -> VolumeEngine {
        VolumeEngine {
            config,
            backend,
            registry: VolumeRegistry::default(),
            stranded: StrandedLedger::default(),
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn registry(&self) -> &VolumeRegistry {
        &self.registry
    }

    fn parse(&self, name: &str) -> RbdVolResult<(VolumeSpec, PathBuf)> {
        let spec = parse_volume_spec(name, &self.config)?;
        let mountpoint = spec.mountpoint(&self.config.volume_root);
        Ok((spec, mountpoint))
    }

    /// Make sure the image behind name exists and carries a filesystem.
    /// Never touches the registry.
    pub fn create(&self, name: &str) -> RbdVolResult<()> {
        let (spec, mountpoint) = self.parse(name)?;

        if self.registry.contains(&mountpoint) {
            info!(
                "Volume {} is already mounted at {}; nothing to create",
                spec,
                mountpoint.display()
            );
            return Ok(());
        }

        if image_exists(&*self.backend, &spec.pool, &spec.name)? {
            debug!("Image {} already exists", spec);
            return Ok(());
        }

        provision(
            &*self.backend,
            &self.stranded,
            &spec.pool,
            &spec.name,
            &self.config.default_fs_type,
            spec.size_mb,
            LOCK_ID,
        )
    }

    /// Does not delete the image or release anything; the image is kept
    /// for the next user of the same name.
    pub fn remove(&self, name: &str) -> RbdVolResult<()> {
        let (spec, _) = self.parse(name)?;
        info!("Remove requested for volume {}; image is retained", spec);
        Ok(())
    }

    pub fn path(&self, name: &str) -> RbdVolResult<PathBuf> {
        self.parse(name).map(|(_, mountpoint)| mountpoint)
    }

    /// Lock, map and mount the image, returning the mountpoint. On failure
    /// everything acquired so far is given back in reverse order.
    pub fn mount(&self, name: &str) -> RbdVolResult<PathBuf> {
        let (spec, mountpoint) = self.parse(name)?;
        let backend = &*self.backend;
        let fs_type = &self.config.default_fs_type;

        let locker = lock::acquire(backend, &spec.pool, &spec.name, LOCK_ID)?;
        let mut rollback =
            Rollback::new(backend, &self.stranded, &spec.pool, &spec.name).at_mountpoint(&mountpoint);
        rollback.locked(LOCK_ID, &locker);

        let device = match device::map(backend, &spec.pool, &spec.name) {
            Ok(device) => device,
            Err(e) => {
                rollback.unwind(&e);
                return Err(e);
            }
        };
        rollback.mapped(&device);

        if let Err(e) = device::create_mountpoint(&mountpoint) {
            rollback.unwind(&e);
            return Err(e);
        }

        if let Err(e) = device::mount(backend, &device, &mountpoint, fs_type) {
            rollback.unwind(&e);
            return Err(e);
        }
        rollback.commit();

        let state = VolumeState {
            name: spec.name.clone(),
            device,
            locker,
            fstype: fs_type.clone(),
            pool: spec.pool.clone(),
        };
        if let Some(old) = self.registry.insert(mountpoint.clone(), state) {
            warn!(
                "Volume {} replaced a stale registry entry for device {} at {}",
                spec,
                old.device.display(),
                mountpoint.display()
            );
        }
        info!("Mounted volume {} at {}", spec, mountpoint.display());
        Ok(mountpoint)
    }

    /// Unmount, unmap and unlock a live volume. The first failing step
    /// ends the teardown: later steps are not attempted and the registry
    /// entry is kept, so the volume's real state must be checked by hand.
    pub fn unmount(&self, name: &str) -> RbdVolResult<()> {
        let (spec, mountpoint) = self.parse(name)?;
        let backend = &*self.backend;

        let state = self.registry.get(&mountpoint).ok_or_else(|| {
            RbdVolError::Engine(
                ErrorEnum::StateNotFound,
                format!("No state found for volume {} at {}", spec, mountpoint.display()),
            )
        })?;

        let strand = |resource: Resource, err: &RbdVolError| {
            self.stranded.record(StrandedResource {
                pool: state.pool.clone(),
                name: state.name.clone(),
                mountpoint: Some(mountpoint.clone()),
                resource,
                cause: format!("{err}; remaining teardown steps were not attempted"),
            });
        };

        device::unmount(backend, &state.device).inspect_err(|e| {
            strand(
                Resource::Mount {
                    device: state.device.clone(),
                },
                e,
            )
        })?;

        device::unmap(backend, &state.device).inspect_err(|e| {
            strand(
                Resource::Mapping {
                    device: state.device.clone(),
                },
                e,
            )
        })?;

        lock::release(backend, &state.pool, &state.name, LOCK_ID, &state.locker).inspect_err(
            |e| {
                strand(
                    Resource::Lock {
                        lock_id: LOCK_ID.to_string(),
                        locker: state.locker.clone(),
                    },
                    e,
                )
            },
        )?;

        if !self.registry.remove_if_same(&mountpoint, &state) {
            info!(
                "Volume {} was mounted again at {} while being torn down; keeping the newer entry",
                spec,
                mountpoint.display()
            );
        }
        self.stranded.clear_mountpoint(&mountpoint);
        info!("Unmounted volume {} from {}", spec, mountpoint.display());
        Ok(())
    }

    /// Live volumes and resources left behind by failed clean ups.
    pub fn report(&self) -> Value {
        json!({
            "volumes": self
                .registry
                .snapshot()
                .into_iter()
                .map(|(mountpoint, state)| json!({
                    "mountpoint": mountpoint,
                    "pool": state.pool,
                    "name": state.name,
                    "device": state.device,
                    "locker": state.locker,
                    "fstype": state.fstype,
                }))
                .collect::<Vec<_>>(),
            "stranded": self.stranded.entries(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        ffi::OsStr,
        fs,
        path::Path,
        sync::{
            atomic::{AtomicBool, Ordering},
            Mutex, OnceLock, Weak,
        },
        thread,
    };

    use assert_matches::assert_matches;
    use tempfile::TempDir;

    use crate::engine::{
        sim_engine::{BackendCall, SimBackend, SimOp},
        types::ToolPaths,
    };

    use super::*;

    struct Fixture {
        engine: VolumeEngine,
        sim: Arc<SimBackend>,
        root: TempDir,
    }

    fn config(root: &Path) -> DriverConfig {
        DriverConfig {
            volume_root: root.to_owned(),
            default_pool: "rbd".to_string(),
            default_fs_type: "xfs".to_string(),
            default_size_mb: 128,
            tool_paths: ToolPaths::default(),
        }
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let sim = Arc::new(SimBackend::default());
        Fixture {
            engine: VolumeEngine::new(config(root.path()), sim.clone()),
            sim,
            root,
        }
    }

    // A fixture whose image for name already exists, with the call log
    // cleared.
    fn created(name: &str) -> Fixture {
        let f = fixture();
        f.engine.create(name).unwrap();
        f.sim.clear_calls();
        f
    }

    #[test]
    fn test_path() {
        let f = fixture();
        assert_eq!(
            f.engine.path("ssd/db@10").unwrap(),
            f.root.path().join("ssd").join("db")
        );
        assert_eq!(
            f.engine.path("db").unwrap(),
            f.root.path().join("rbd").join("db")
        );
        assert!(f.sim.calls().is_empty());
        assert_matches!(
            f.engine.path("/bad").map_err(|e| e.kind()),
            Err(Some(ErrorEnum::Parse))
        );
    }

    #[test]
    fn test_create_provisions_once() {
        let f = fixture();
        f.engine.create("vol@256").unwrap();
        assert_eq!(f.sim.image_size("rbd", "vol"), Some(256));
        assert_eq!(f.sim.filesystem("rbd", "vol"), Some("xfs".to_string()));

        f.sim.clear_calls();
        f.engine.create("vol@256").unwrap();
        assert_eq!(
            f.sim.calls(),
            vec![BackendCall::ListImages("rbd".to_string())]
        );
        assert!(f.engine.registry().is_empty());
    }

    #[test]
    /// Create for a mounted volume does not consult the backend.
    fn test_create_mounted_is_noop() {
        let f = created("vol");
        f.engine.mount("vol").unwrap();
        f.sim.clear_calls();
        f.engine.create("vol").unwrap();
        assert!(f.sim.calls().is_empty());
    }

    #[test]
    fn test_create_listing_failure() {
        let f = fixture();
        f.sim.fail_on(SimOp::ListImages);
        assert_matches!(
            f.engine.create("vol").map_err(|e| e.kind()),
            Err(Some(ErrorEnum::Backend))
        );
        assert_eq!(f.sim.image_size("rbd", "vol"), None);
    }

    #[test]
    /// Teardown calls mirror the attach calls in reverse.
    fn test_mount_unmount_symmetry() {
        let f = created("vol");
        let mountpoint = f.engine.mount("vol").unwrap();
        assert!(mountpoint.is_dir());
        let state = f.engine.registry().get(&mountpoint).unwrap();
        assert_eq!(state.pool, "rbd");
        assert_eq!(state.fstype, "xfs");
        assert!(f.sim.is_mounted(&state.device));

        let device = state.device.clone();
        assert_eq!(
            f.sim.calls(),
            vec![
                BackendCall::LockAdd("rbd/vol".to_string()),
                BackendCall::LockList("rbd/vol".to_string()),
                BackendCall::MapImage("rbd/vol".to_string()),
                BackendCall::MountDevice(device.clone(), mountpoint.clone()),
            ]
        );

        f.sim.clear_calls();
        f.engine.unmount("vol").unwrap();
        assert_eq!(
            f.sim.calls(),
            vec![
                BackendCall::UnmountDevice(device.clone()),
                BackendCall::UnmapImage(device),
                BackendCall::LockRemove("rbd/vol".to_string()),
            ]
        );
        assert!(!f.engine.registry().contains(&mountpoint));
        assert!(!f.sim.is_locked("rbd", "vol"));
    }

    #[test]
    /// A map failure releases the lock exactly once.
    fn test_mount_map_failure_unlocks() {
        let f = created("vol");
        f.sim.fail_on(SimOp::MapImage);
        assert_matches!(
            f.engine.mount("vol").map_err(|e| e.kind()),
            Err(Some(ErrorEnum::Attach))
        );
        assert_eq!(
            f.sim.calls(),
            vec![
                BackendCall::LockAdd("rbd/vol".to_string()),
                BackendCall::LockList("rbd/vol".to_string()),
                BackendCall::MapImage("rbd/vol".to_string()),
                BackendCall::LockRemove("rbd/vol".to_string()),
            ]
        );
        assert!(!f.sim.is_locked("rbd", "vol"));
        assert!(f.engine.registry().is_empty());
    }

    #[test]
    fn test_mount_lock_failure() {
        let f = created("vol");
        f.sim.fail_on(SimOp::LockAdd);
        assert_matches!(
            f.engine.mount("vol").map_err(|e| e.kind()),
            Err(Some(ErrorEnum::Lock))
        );
        assert_eq!(
            f.sim.calls(),
            vec![BackendCall::LockAdd("rbd/vol".to_string())]
        );
    }

    #[test]
    /// A mount failure unmaps, then unlocks.
    fn test_mount_failure_rolls_back() {
        let f = created("vol");
        f.sim.fail_on(SimOp::MountDevice);
        assert_matches!(
            f.engine.mount("vol").map_err(|e| e.kind()),
            Err(Some(ErrorEnum::Mount))
        );
        let calls = f.sim.calls();
        assert_matches!(
            &calls[calls.len() - 3..],
            [
                BackendCall::MountDevice(_, _),
                BackendCall::UnmapImage(_),
                BackendCall::LockRemove(_)
            ]
        );
        assert!(!f.sim.is_mapped("rbd", "vol"));
        assert!(!f.sim.is_locked("rbd", "vol"));
        assert!(f.engine.registry().is_empty());
    }

    #[test]
    /// A mountpoint that can not be created is rolled back before mounting.
    fn test_mount_mkdir_failure_rolls_back() {
        let f = created("vol");
        fs::write(f.root.path().join("rbd"), b"in the way").unwrap();
        assert_matches!(
            f.engine.mount("vol").map_err(|e| e.kind()),
            Err(Some(ErrorEnum::Mount))
        );
        assert!(!f
            .sim
            .calls()
            .iter()
            .any(|c| matches!(c, BackendCall::MountDevice(_, _))));
        assert!(!f.sim.is_mapped("rbd", "vol"));
        assert!(!f.sim.is_locked("rbd", "vol"));
    }

    #[test]
    /// The caller sees the original failure even when roll back fails.
    fn test_mount_rollback_failure_is_ledgered() {
        let f = created("vol");
        f.sim.fail_on(SimOp::MountDevice);
        f.sim.fail_on(SimOp::UnmapImage);
        assert_matches!(
            f.engine.mount("vol").map_err(|e| e.kind()),
            Err(Some(ErrorEnum::Mount))
        );
        assert!(f.sim.is_mapped("rbd", "vol"));
        assert!(!f.sim.is_locked("rbd", "vol"));

        let report = f.engine.report();
        let stranded = report["stranded"].as_array().unwrap();
        assert_eq!(stranded.len(), 1);
        assert_eq!(stranded[0]["resource"]["type"], "Mapping");
    }

    #[test]
    fn test_unmount_unknown() {
        let f = created("vol");
        f.engine.mount("vol").unwrap();
        f.sim.clear_calls();
        assert_matches!(
            f.engine.unmount("other").map_err(|e| e.kind()),
            Err(Some(ErrorEnum::StateNotFound))
        );
        assert_eq!(f.engine.registry().len(), 1);
        assert!(f.sim.calls().is_empty());
    }

    #[test]
    /// Teardown stops at the first failing step and keeps the entry.
    fn test_unmount_stops_at_failure() {
        let f = created("vol");
        let mountpoint = f.engine.mount("vol").unwrap();
        f.sim.clear_calls();
        f.sim.fail_on(SimOp::UnmapImage);

        assert_matches!(
            f.engine.unmount("vol").map_err(|e| e.kind()),
            Err(Some(ErrorEnum::Attach))
        );
        let calls = f.sim.calls();
        assert_eq!(calls.len(), 2);
        assert_matches!(calls[1], BackendCall::UnmapImage(_));
        assert!(f.engine.registry().contains(&mountpoint));
        assert!(f.sim.is_locked("rbd", "vol"));

        let report = f.engine.report();
        assert_eq!(report["stranded"].as_array().unwrap().len(), 1);
        assert_eq!(report["volumes"].as_array().unwrap().len(), 1);
    }

    #[test]
    /// Retrying a failing teardown does not grow the ledger, and a teardown
    /// that finally succeeds clears it.
    fn test_unmount_retries_are_ledgered_once() {
        let f = created("vol");
        let mountpoint = f.engine.mount("vol").unwrap();
        f.sim.fail_on(SimOp::UnmountDevice);
        for _ in 0..300 {
            assert_matches!(
                f.engine.unmount("vol").map_err(|e| e.kind()),
                Err(Some(ErrorEnum::Mount))
            );
        }
        let report = f.engine.report();
        let stranded = report["stranded"].as_array().unwrap();
        assert_eq!(stranded.len(), 1);
        assert_eq!(stranded[0]["resource"]["type"], "Mount");

        f.sim.clear_failures();
        f.engine.unmount("vol").unwrap();
        assert!(!f.engine.registry().contains(&mountpoint));
        assert!(f.engine.report()["stranded"].as_array().unwrap().is_empty());
    }

    // Mounts the volume again from another thread right after its lock is
    // released, the way a second request racing an unmount would.
    #[derive(Debug)]
    struct RemountOnUnlock {
        sim: Arc<SimBackend>,
        engine: OnceLock<Weak<VolumeEngine>>,
        fired: AtomicBool,
        remounted: Mutex<Option<Result<PathBuf, String>>>,
    }

    impl Backend for RemountOnUnlock {
        fn list_images(&self, pool: &str) -> RbdVolResult<Vec<String>> {
            self.sim.list_images(pool)
        }

        fn create_image(&self, pool: &str, name: &str, size_mb: u64) -> RbdVolResult<()> {
            self.sim.create_image(pool, name, size_mb)
        }

        fn lock_add(&self, pool: &str, name: &str, lock_id: &str) -> RbdVolResult<()> {
            self.sim.lock_add(pool, name, lock_id)
        }

        fn lock_list(&self, pool: &str, name: &str) -> RbdVolResult<String> {
            self.sim.lock_list(pool, name)
        }

        fn lock_remove(
            &self,
            pool: &str,
            name: &str,
            lock_id: &str,
            locker: &str,
        ) -> RbdVolResult<()> {
            self.sim.lock_remove(pool, name, lock_id, locker)?;
            if let Some(engine) = self.engine.get().and_then(Weak::upgrade) {
                if !self.fired.swap(true, Ordering::SeqCst) {
                    let name = name.to_string();
                    let res = thread::spawn(move || engine.mount(&name))
                        .join()
                        .unwrap()
                        .map_err(|e| e.to_string());
                    *self.remounted.lock().unwrap() = Some(res);
                }
            }
            Ok(())
        }

        fn map_image(&self, pool: &str, name: &str) -> RbdVolResult<String> {
            self.sim.map_image(pool, name)
        }

        fn unmap_image(&self, device: &Path) -> RbdVolResult<()> {
            self.sim.unmap_image(device)
        }

        fn format_device(&self, device: &Path, fs_type: &str) -> RbdVolResult<()> {
            self.sim.format_device(device, fs_type)
        }

        fn mount_device(
            &self,
            device: &Path,
            mountpoint: &Path,
            fs_type: &str,
        ) -> RbdVolResult<()> {
            self.sim.mount_device(device, mountpoint, fs_type)
        }

        fn unmount_device(&self, device: &Path) -> RbdVolResult<()> {
            self.sim.unmount_device(device)
        }
    }

    #[test]
    /// A mount that lands while an unmount of the same volume is finishing
    /// keeps its registry entry.
    fn test_unmount_keeps_concurrent_remount() {
        let root = tempfile::tempdir().unwrap();
        let sim = Arc::new(SimBackend::default());
        let backend = Arc::new(RemountOnUnlock {
            sim: Arc::clone(&sim),
            engine: OnceLock::new(),
            fired: AtomicBool::new(false),
            remounted: Mutex::new(None),
        });
        let engine = Arc::new(VolumeEngine::new(config(root.path()), backend.clone()));
        engine.create("vol").unwrap();
        let mountpoint = engine.mount("vol").unwrap();
        let old = engine.registry().get(&mountpoint).unwrap();
        backend.engine.set(Arc::downgrade(&engine)).unwrap();

        engine.unmount("vol").unwrap();
        assert_eq!(
            backend.remounted.lock().unwrap().take(),
            Some(Ok(mountpoint.clone()))
        );

        let new = engine.registry().get(&mountpoint).unwrap();
        assert_ne!(new, old);
        assert!(sim.is_locked("rbd", "vol"));
        assert!(sim.is_mounted(&new.device));

        engine.unmount("vol").unwrap();
        assert!(engine.registry().is_empty());
        assert!(!sim.is_locked("rbd", "vol"));
        assert!(!sim.is_mapped("rbd", "vol"));
    }

    #[test]
    fn test_remove_is_advisory() {
        let f = created("vol");
        let mountpoint = f.engine.mount("vol").unwrap();
        f.sim.clear_calls();
        f.engine.remove("vol").unwrap();
        assert!(f.sim.calls().is_empty());
        assert!(f.engine.registry().contains(&mountpoint));
        assert_matches!(
            f.engine.remove("").map_err(|e| e.kind()),
            Err(Some(ErrorEnum::Parse))
        );
    }

    #[test]
    /// Mounting two volumes at once yields two independent entries.
    fn test_concurrent_mounts() {
        let Fixture { engine, root: _root, .. } = fixture();
        engine.create("alpha").unwrap();
        engine.create("beta").unwrap();
        let engine = Arc::new(engine);

        let handles = ["alpha", "beta"]
            .into_iter()
            .map(|name| {
                let engine = Arc::clone(&engine);
                thread::spawn(move || engine.mount(name))
            })
            .collect::<Vec<_>>();
        let mountpoints = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect::<Vec<_>>();

        assert_eq!(engine.registry().len(), 2);
        let alpha = engine.registry().get(&mountpoints[0]).unwrap();
        let beta = engine.registry().get(&mountpoints[1]).unwrap();
        assert_eq!(alpha.name, "alpha");
        assert_eq!(beta.name, "beta");
        assert_ne!(alpha.device, beta.device);
        assert_ne!(alpha.locker, beta.locker);
        assert!(mountpoints
            .iter()
            .all(|m| m.parent().and_then(Path::file_name) == Some(OsStr::new("rbd"))));
    }
}
