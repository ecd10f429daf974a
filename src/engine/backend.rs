// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{fmt::Debug, path::Path};

use crate::rbdvol::RbdVolResult;

/// The narrow command surface the engine needs from the storage cluster
/// and the host. Every method is a blocking call; none of them retry.
pub trait Backend: Debug + Send + Sync {
    /// Names of all images in the pool.
    fn list_images(&self, pool: &str) -> RbdVolResult<Vec<String>>;

    /// Create an image of size_mb megabytes.
    fn create_image(&self, pool: &str, name: &str, size_mb: u64) -> RbdVolResult<()>;

    /// Take the exclusive lock lock_id on the image.
    fn lock_add(&self, pool: &str, name: &str, lock_id: &str) -> RbdVolResult<()>;

    /// The raw lock listing for the image: one header line followed by
    /// `<locker> <lock id> ...` lines.
    fn lock_list(&self, pool: &str, name: &str) -> RbdVolResult<String>;

    /// Remove the lock identified by lock_id and locker.
    fn lock_remove(&self, pool: &str, name: &str, lock_id: &str, locker: &str)
        -> RbdVolResult<()>;

    /// Attach the image as a kernel block device, returning its path.
    fn map_image(&self, pool: &str, name: &str) -> RbdVolResult<String>;

    fn unmap_image(&self, device: &Path) -> RbdVolResult<()>;

    /// Create a filesystem of type fs_type on device.
    fn format_device(&self, device: &Path, fs_type: &str) -> RbdVolResult<()>;

    fn mount_device(&self, device: &Path, mountpoint: &Path, fs_type: &str) -> RbdVolResult<()>;

    fn unmount_device(&self, device: &Path) -> RbdVolResult<()>;
}
