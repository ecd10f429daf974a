// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Handles invoking external binaries.
// Every binary is looked up once, when the daemon starts, by
// discover_tools(). If any is missing the daemon must not start. A binary
// may still be removed while the daemon runs, so its existence is checked
// again before each invocation and an explicit error is returned if it is
// gone.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::Command,
};

use crate::{
    engine::types::ToolPaths,
    rbdvol::{RbdVolError, RbdVolResult},
};

const BINARIES_PATHS: [&str; 4] = ["/usr/sbin", "/sbin", "/usr/bin", "/bin"];

pub const RBD: &str = "rbd";
pub const MOUNT: &str = "mount";
pub const UMOUNT: &str = "umount";

/// The name of the filesystem creation tool for fs_type.
pub fn mkfs_binary(fs_type: &str) -> String {
    format!("mkfs.{fs_type}")
}

/// Find the binary with the given name by looking in likely locations.
/// Return None if no binary was found.
/// Search an explicit list of directories rather than the user's PATH
/// environment variable. The daemon may be running when there is no PATH
/// variable set.
fn find_binary(name: &str) -> Option<PathBuf> {
    find_binary_in(name, &BINARIES_PATHS)
}

fn find_binary_in<P>(name: &str, dirs: &[P]) -> Option<PathBuf>
where
    P: AsRef<Path>,
{
    dirs.iter()
        .map(|dir| dir.as_ref().join(name))
        .find(|path| path.exists())
}

/// Resolve every binary the real backend might invoke for volumes of
/// fs_type. Return an error naming all those that are missing.
pub fn discover_tools(fs_type: &str) -> RbdVolResult<ToolPaths> {
    let names = [
        RBD.to_string(),
        MOUNT.to_string(),
        UMOUNT.to_string(),
        mkfs_binary(fs_type),
    ];
    let (found, missing): (Vec<_>, Vec<_>) = names
        .into_iter()
        .map(|name| {
            let path = find_binary(&name);
            (name, path)
        })
        .partition(|(_, path)| path.is_some());

    if missing.is_empty() {
        Ok(ToolPaths::new(
            found
                .into_iter()
                .filter_map(|(name, path)| path.map(|p| (name, p)))
                .collect::<HashMap<_, _>>(),
        ))
    } else {
        Err(RbdVolError::BinariesNotFound {
            names: missing.into_iter().map(|(name, _)| name).collect(),
            locations: BINARIES_PATHS.iter().map(|path| path.to_string()).collect(),
        })
    }
}

/// Get the absolute path for the executable with the given name, verifying
/// that it is still present.
pub fn get_executable<'a>(tools: &'a ToolPaths, name: &str) -> RbdVolResult<&'a Path> {
    match tools.get(name) {
        Some(path) if path.exists() => Ok(path),
        Some(path) => Err(RbdVolError::BinariesNotFound {
            names: vec![name.to_string()],
            locations: vec![path.display().to_string()],
        }),
        None => Err(RbdVolError::BinariesNotFound {
            names: vec![name.to_string()],
            locations: BINARIES_PATHS.iter().map(|path| path.to_string()).collect(),
        }),
    }
}

/// Invoke the specified command and return its standard output. Return an
/// error if invoking the command fails or if the command itself fails.
pub fn execute_cmd(cmd: &mut Command) -> RbdVolResult<String> {
    trace!("Executing {:?}", cmd);
    match cmd.output() {
        Err(err) => Err(RbdVolError::CommandExecutionFailure {
            cmd: format!("{cmd:?}"),
            err,
        }),
        Ok(result) => {
            if result.status.success() {
                Ok(String::from_utf8_lossy(&result.stdout).into_owned())
            } else {
                Err(RbdVolError::CommandFailure {
                    cmd: format!("{cmd:?}"),
                    status: result.status,
                    stderr: String::from_utf8_lossy(&result.stderr).into_owned(),
                })
            }
        }
    }
}
