// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use strum_macros::{AsRefStr, Display};

use crate::{
    engine::backend::Backend,
    rbdvol::{RbdVolError, RbdVolResult},
};

/// The backend operations, for selecting which of them should fail.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, AsRefStr, Display)]
pub enum SimOp {
    ListImages,
    CreateImage,
    LockAdd,
    LockList,
    LockRemove,
    MapImage,
    UnmapImage,
    FormatDevice,
    MountDevice,
    UnmountDevice,
}

/// A backend call as it was issued, whether or not it succeeded. Images
/// are identified as `pool/name`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum BackendCall {
    ListImages(String),
    CreateImage(String),
    LockAdd(String),
    LockList(String),
    LockRemove(String),
    MapImage(String),
    UnmapImage(PathBuf),
    FormatDevice(PathBuf),
    MountDevice(PathBuf, PathBuf),
    UnmountDevice(PathBuf),
}

#[derive(Debug)]
struct SimImage {
    size_mb: u64,
    locks: Vec<(String, String)>,
    filesystem: Option<String>,
}

#[derive(Debug, Default)]
struct SimState {
    images: HashMap<(String, String), SimImage>,
    // device -> (pool, name)
    mappings: HashMap<PathBuf, (String, String)>,
    // device -> mountpoint
    mounts: HashMap<PathBuf, PathBuf>,
    next_client: u64,
    next_device: u64,
    last_device: Option<PathBuf>,
    failures: HashSet<SimOp>,
    garble_lock_listing: bool,
    calls: Vec<BackendCall>,
}

impl SimState {
    fn check(&mut self, op: SimOp, call: BackendCall) -> RbdVolResult<()> {
        self.calls.push(call);
        if self.failures.contains(&op) {
            Err(RbdVolError::Msg(format!("simulated failure of {op}")))
        } else {
            Ok(())
        }
    }

    fn image_mut(&mut self, pool: &str, name: &str) -> RbdVolResult<&mut SimImage> {
        self.images
            .get_mut(&(pool.to_string(), name.to_string()))
            .ok_or_else(|| RbdVolError::Msg(format!("image {pool}/{name} does not exist")))
    }

    fn mapped_image(&self, device: &Path) -> RbdVolResult<(String, String)> {
        self.mappings
            .get(device)
            .cloned()
            .ok_or_else(|| RbdVolError::Msg(format!("{} is not mapped", device.display())))
    }
}

/// An in-memory stand-in for an RBD cluster and the host's mount table.
/// Each lock is taken by a fresh client id, as each `rbd` invocation is a
/// new cluster client.
#[derive(Debug, Default)]
pub struct SimBackend {
    state: Mutex<SimState>,
}

impl SimBackend {
    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every later invocation of op fail.
    pub fn fail_on(&self, op: SimOp) {
        self.state().failures.insert(op);
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    /// Report lock listings in which no holder can be identified.
    pub fn garble_lock_listing(&self) {
        self.state().garble_lock_listing = true;
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn is_locked(&self, pool: &str, name: &str) -> bool {
        self.state()
            .images
            .get(&(pool.to_string(), name.to_string()))
            .is_some_and(|image| !image.locks.is_empty())
    }

    pub fn is_mapped(&self, pool: &str, name: &str) -> bool {
        self.state()
            .mappings
            .values()
            .any(|(p, n)| p == pool && n == name)
    }

    pub fn is_mounted(&self, device: &Path) -> bool {
        self.state().mounts.contains_key(device)
    }

    pub fn image_size(&self, pool: &str, name: &str) -> Option<u64> {
        self.state()
            .images
            .get(&(pool.to_string(), name.to_string()))
            .map(|image| image.size_mb)
    }

    pub fn filesystem(&self, pool: &str, name: &str) -> Option<String> {
        self.state()
            .images
            .get(&(pool.to_string(), name.to_string()))
            .and_then(|image| image.filesystem.clone())
    }

    /// The device most recently handed out by map_image.
    pub fn last_device(&self) -> Option<PathBuf> {
        self.state().last_device.clone()
    }
}

impl Backend for SimBackend {
    fn list_images(&self, pool: &str) -> RbdVolResult<Vec<String>> {
        let mut state = self.state();
        state.check(SimOp::ListImages, BackendCall::ListImages(pool.to_string()))?;
        let mut names = state
            .images
            .keys()
            .filter(|(p, _)| p == pool)
            .map(|(_, n)| n.clone())
            .collect::<Vec<_>>();
        names.sort();
        Ok(names)
    }

    fn create_image(&self, pool: &str, name: &str, size_mb: u64) -> RbdVolResult<()> {
        let mut state = self.state();
        state.check(
            SimOp::CreateImage,
            BackendCall::CreateImage(format!("{pool}/{name}")),
        )?;
        let key = (pool.to_string(), name.to_string());
        if state.images.contains_key(&key) {
            return Err(RbdVolError::Msg(format!(
                "image {pool}/{name} already exists"
            )));
        }
        state.images.insert(
            key,
            SimImage {
                size_mb,
                locks: Vec::new(),
                filesystem: None,
            },
        );
        Ok(())
    }

    fn lock_add(&self, pool: &str, name: &str, lock_id: &str) -> RbdVolResult<()> {
        let mut state = self.state();
        state.check(SimOp::LockAdd, BackendCall::LockAdd(format!("{pool}/{name}")))?;
        state.next_client += 1;
        let locker = format!("client.{}", 4100 + state.next_client);
        let image = state.image_mut(pool, name)?;
        if !image.locks.is_empty() {
            return Err(RbdVolError::Msg(format!(
                "image {pool}/{name} is already locked"
            )));
        }
        image.locks.push((lock_id.to_string(), locker));
        Ok(())
    }

    fn lock_list(&self, pool: &str, name: &str) -> RbdVolResult<String> {
        let mut state = self.state();
        state.check(SimOp::LockList, BackendCall::LockList(format!("{pool}/{name}")))?;
        let garble = state.garble_lock_listing;
        let image = state.image_mut(pool, name)?;
        if image.locks.is_empty() {
            return Ok(String::new());
        }
        let mut listing = format!(
            "There is {} exclusive lock on this image.\nLocker      ID          Address\n",
            image.locks.len()
        );
        for (lock_id, locker) in &image.locks {
            if garble {
                listing.push_str(&format!("{locker}\n"));
            } else {
                listing.push_str(&format!("{locker} {lock_id}  192.0.2.1:0/1234\n"));
            }
        }
        Ok(listing)
    }

    fn lock_remove(
        &self,
        pool: &str,
        name: &str,
        lock_id: &str,
        locker: &str,
    ) -> RbdVolResult<()> {
        let mut state = self.state();
        state.check(
            SimOp::LockRemove,
            BackendCall::LockRemove(format!("{pool}/{name}")),
        )?;
        let image = state.image_mut(pool, name)?;
        let before = image.locks.len();
        image.locks.retain(|(id, l)| !(id == lock_id && l == locker));
        if image.locks.len() == before {
            return Err(RbdVolError::Msg(format!(
                "no lock {lock_id} held by {locker} on image {pool}/{name}"
            )));
        }
        Ok(())
    }

    fn map_image(&self, pool: &str, name: &str) -> RbdVolResult<String> {
        let mut state = self.state();
        state.check(SimOp::MapImage, BackendCall::MapImage(format!("{pool}/{name}")))?;
        state.image_mut(pool, name)?;
        let device = PathBuf::from(format!("/dev/rbd{}", state.next_device));
        state.next_device += 1;
        state
            .mappings
            .insert(device.clone(), (pool.to_string(), name.to_string()));
        state.last_device = Some(device.clone());
        Ok(format!("{}\n", device.display()))
    }

    fn unmap_image(&self, device: &Path) -> RbdVolResult<()> {
        let mut state = self.state();
        state.check(SimOp::UnmapImage, BackendCall::UnmapImage(device.to_owned()))?;
        state.mapped_image(device)?;
        if state.mounts.contains_key(device) {
            return Err(RbdVolError::Msg(format!(
                "{} is busy",
                device.display()
            )));
        }
        state.mappings.remove(device);
        Ok(())
    }

    fn format_device(&self, device: &Path, fs_type: &str) -> RbdVolResult<()> {
        let mut state = self.state();
        state.check(
            SimOp::FormatDevice,
            BackendCall::FormatDevice(device.to_owned()),
        )?;
        let (pool, name) = state.mapped_image(device)?;
        if state.mounts.contains_key(device) {
            return Err(RbdVolError::Msg(format!(
                "{} is mounted",
                device.display()
            )));
        }
        state.image_mut(&pool, &name)?.filesystem = Some(fs_type.to_string());
        Ok(())
    }

    fn mount_device(&self, device: &Path, mountpoint: &Path, fs_type: &str) -> RbdVolResult<()> {
        let mut state = self.state();
        state.check(
            SimOp::MountDevice,
            BackendCall::MountDevice(device.to_owned(), mountpoint.to_owned()),
        )?;
        let (pool, name) = state.mapped_image(device)?;
        if state.image_mut(&pool, &name)?.filesystem.as_deref() != Some(fs_type) {
            return Err(RbdVolError::Msg(format!(
                "{} does not hold a {} filesystem",
                device.display(),
                fs_type
            )));
        }
        if !mountpoint.is_dir() {
            return Err(RbdVolError::Msg(format!(
                "mount point {} does not exist",
                mountpoint.display()
            )));
        }
        if state.mounts.contains_key(device) {
            return Err(RbdVolError::Msg(format!(
                "{} is already mounted",
                device.display()
            )));
        }
        state.mounts.insert(device.to_owned(), mountpoint.to_owned());
        Ok(())
    }

    fn unmount_device(&self, device: &Path) -> RbdVolResult<()> {
        let mut state = self.state();
        state.check(
            SimOp::UnmountDevice,
            BackendCall::UnmountDevice(device.to_owned()),
        )?;
        state
            .mounts
            .remove(device)
            .map(|_| ())
            .ok_or_else(|| RbdVolError::Msg(format!("{} is not mounted", device.display())))
    }
}
