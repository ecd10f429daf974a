// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Kernel device attachment, filesystem creation, and mounting. Callers
// must hold the image lock for the whole time a device is mapped.

use std::{
    fs::{self, DirBuilder},
    os::unix::fs::{DirBuilderExt, PermissionsExt},
    path::{Path, PathBuf},
};

use crate::{
    engine::backend::Backend,
    rbdvol::{ErrorEnum, RbdVolError, RbdVolResult},
};

const MOUNTPOINT_MODE: u32 = 0o775;

/// Map the image to a kernel block device and return the device path.
pub fn map(backend: &dyn Backend, pool: &str, name: &str) -> RbdVolResult<PathBuf> {
    let output = backend.map_image(pool, name).map_err(|e| {
        RbdVolError::engine(
            ErrorEnum::Attach,
            format!("Unable to map image {pool}/{name} to a kernel device"),
            &e,
        )
    })?;
    let device = output.trim();
    if device.is_empty() {
        return Err(RbdVolError::Engine(
            ErrorEnum::Attach,
            format!("Mapping image {pool}/{name} did not report a device"),
        ));
    }
    debug!("Mapped image {}/{} to {}", pool, name, device);
    Ok(PathBuf::from(device))
}

pub fn unmap(backend: &dyn Backend, device: &Path) -> RbdVolResult<()> {
    backend.unmap_image(device).map_err(|e| {
        RbdVolError::engine(
            ErrorEnum::Attach,
            format!("Unable to unmap {}", device.display()),
            &e,
        )
    })?;
    debug!("Unmapped {}", device.display());
    Ok(())
}

/// Create a filesystem on a freshly mapped device. Destroys any data on it.
pub fn format(backend: &dyn Backend, device: &Path, fs_type: &str) -> RbdVolResult<()> {
    backend.format_device(device, fs_type).map_err(|e| {
        RbdVolError::engine(
            ErrorEnum::Format,
            format!(
                "Unable to make a {} filesystem on {}",
                fs_type,
                device.display()
            ),
            &e,
        )
    })?;
    debug!("Created {} filesystem on {}", fs_type, device.display());
    Ok(())
}

/// Create the mountpoint directory and any missing parents.
pub fn create_mountpoint(mountpoint: &Path) -> RbdVolResult<()> {
    let res = DirBuilder::new()
        .recursive(true)
        .mode(MOUNTPOINT_MODE)
        .create(mountpoint)
        .and_then(|_| {
            // The process umask may have masked group write.
            fs::set_permissions(mountpoint, fs::Permissions::from_mode(MOUNTPOINT_MODE))
        });
    res.map_err(|e| {
        RbdVolError::engine(
            ErrorEnum::Mount,
            format!("Unable to create mount point {}", mountpoint.display()),
            &RbdVolError::Io(e),
        )
    })
}

pub fn mount(
    backend: &dyn Backend,
    device: &Path,
    mountpoint: &Path,
    fs_type: &str,
) -> RbdVolResult<()> {
    backend
        .mount_device(device, mountpoint, fs_type)
        .map_err(|e| {
            RbdVolError::engine(
                ErrorEnum::Mount,
                format!(
                    "Unable to mount {} on {}",
                    device.display(),
                    mountpoint.display()
                ),
                &e,
            )
        })?;
    debug!("Mounted {} on {}", device.display(), mountpoint.display());
    Ok(())
}

pub fn unmount(backend: &dyn Backend, device: &Path) -> RbdVolResult<()> {
    backend.unmount_device(device).map_err(|e| {
        RbdVolError::engine(
            ErrorEnum::Mount,
            format!("Unable to unmount {}", device.display()),
            &e,
        )
    })?;
    debug!("Unmounted {}", device.display());
    Ok(())
}
