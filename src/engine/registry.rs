// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::engine::types::VolumeState;

/// The live volumes of this host, keyed by mountpoint. An entry exists
/// exactly while its device is mapped, locked and mounted at the key.
#[derive(Debug, Default)]
pub struct VolumeRegistry {
    volumes: Mutex<HashMap<PathBuf, VolumeState>>,
}

impl VolumeRegistry {
    fn volumes(&self) -> MutexGuard<'_, HashMap<PathBuf, VolumeState>> {
        // Every critical section is a single map operation, so a panic in
        // another holder can not leave the map half updated.
        self.volumes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn contains(&self, mountpoint: &Path) -> bool {
        self.volumes().contains_key(mountpoint)
    }

    pub fn get(&self, mountpoint: &Path) -> Option<VolumeState> {
        self.volumes().get(mountpoint).cloned()
    }

    /// Record a newly mounted volume. Returns any entry it displaced.
    pub fn insert(&self, mountpoint: PathBuf, state: VolumeState) -> Option<VolumeState> {
        trace!("Registering volume at {}", mountpoint.display());
        self.volumes().insert(mountpoint, state)
    }

    pub fn remove(&self, mountpoint: &Path) -> Option<VolumeState> {
        trace!("Forgetting volume at {}", mountpoint.display());
        self.volumes().remove(mountpoint)
    }

    /// Forget the entry at mountpoint only if it is still state. A volume
    /// mounted again at the same place after state was torn down keeps its
    /// newer entry.
    pub fn remove_if_same(&self, mountpoint: &Path, state: &VolumeState) -> bool {
        let mut volumes = self.volumes();
        if volumes.get(mountpoint) == Some(state) {
            trace!("Forgetting volume at {}", mountpoint.display());
            volumes.remove(mountpoint);
            true
        } else {
            false
        }
    }

    /// A copy of all entries, ordered by mountpoint.
    pub fn snapshot(&self) -> Vec<(PathBuf, VolumeState)> {
        let mut entries = self
            .volumes()
            .iter()
            .map(|(path, state)| (path.clone(), state.clone()))
            .collect::<Vec<_>>();
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        entries
    }

    pub fn len(&self) -> usize {
        self.volumes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes().is_empty()
    }
}
