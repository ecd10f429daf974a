// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{path::Path, process::Command};

use crate::{
    engine::{
        backend::Backend,
        rbd_engine::cmd::{execute_cmd, get_executable, mkfs_binary, MOUNT, RBD, UMOUNT},
        types::ToolPaths,
    },
    rbdvol::RbdVolResult,
};

/// Drives a real cluster through the `rbd` CLI and the host through the
/// standard filesystem tools.
#[derive(Debug)]
pub struct RbdBackend {
    tools: ToolPaths,
}

impl RbdBackend {
    pub fn new(tools: ToolPaths) -> RbdBackend {
        RbdBackend { tools }
    }

    fn command(&self, name: &str) -> RbdVolResult<Command> {
        get_executable(&self.tools, name).map(Command::new)
    }

    fn rbd(&self) -> RbdVolResult<Command> {
        self.command(RBD)
    }
}

impl Backend for RbdBackend {
    fn list_images(&self, pool: &str) -> RbdVolResult<Vec<String>> {
        let output = execute_cmd(self.rbd()?.arg("ls").arg(pool))?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn create_image(&self, pool: &str, name: &str, size_mb: u64) -> RbdVolResult<()> {
        execute_cmd(
            self.rbd()?
                .arg("create")
                .arg("--pool")
                .arg(pool)
                .arg("--size")
                .arg(size_mb.to_string())
                .arg(name),
        )
        .map(|_| ())
    }

    fn lock_add(&self, pool: &str, name: &str, lock_id: &str) -> RbdVolResult<()> {
        execute_cmd(
            self.rbd()?
                .args(["lock", "add", "--pool", pool, name, lock_id]),
        )
        .map(|_| ())
    }

    fn lock_list(&self, pool: &str, name: &str) -> RbdVolResult<String> {
        execute_cmd(self.rbd()?.args(["lock", "list", "--pool", pool, name]))
    }

    fn lock_remove(
        &self,
        pool: &str,
        name: &str,
        lock_id: &str,
        locker: &str,
    ) -> RbdVolResult<()> {
        execute_cmd(
            self.rbd()?
                .args(["lock", "remove", "--pool", pool, name, lock_id, locker]),
        )
        .map(|_| ())
    }

    fn map_image(&self, pool: &str, name: &str) -> RbdVolResult<String> {
        execute_cmd(self.rbd()?.args(["map", "--pool", pool, name]))
    }

    fn unmap_image(&self, device: &Path) -> RbdVolResult<()> {
        execute_cmd(self.rbd()?.arg("unmap").arg(device)).map(|_| ())
    }

    fn format_device(&self, device: &Path, fs_type: &str) -> RbdVolResult<()> {
        execute_cmd(self.command(&mkfs_binary(fs_type))?.arg(device)).map(|_| ())
    }

    fn mount_device(&self, device: &Path, mountpoint: &Path, fs_type: &str) -> RbdVolResult<()> {
        execute_cmd(
            self.command(MOUNT)?
                .arg("-t")
                .arg(fs_type)
                .arg(device)
                .arg(mountpoint),
        )
        .map(|_| ())
    }

    fn unmount_device(&self, device: &Path) -> RbdVolResult<()> {
        execute_cmd(self.command(UMOUNT)?.arg(device)).map(|_| ())
    }
}
