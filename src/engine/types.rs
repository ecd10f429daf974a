// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    collections::HashMap,
    fmt::{self, Display},
    path::{Path, PathBuf},
};

use serde_derive::Serialize;

/// A volume request decoded from a `[pool/]name[@size]` string.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct VolumeSpec {
    pub pool: String,
    pub name: String,
    pub size_mb: u64,
}

impl VolumeSpec {
    /// The deterministic host directory for this volume.
    pub fn mountpoint(&self, volume_root: &Path) -> PathBuf {
        [volume_root, Path::new(&self.pool), Path::new(&self.name)]
            .iter()
            .collect()
    }
}

impl Display for VolumeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pool, self.name)
    }
}

/// Bookkeeping for a volume that is mapped, locked, and mounted.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct VolumeState {
    pub name: String,
    pub device: PathBuf,
    pub locker: String,
    pub fstype: String,
    pub pool: String,
}

/// Resolved absolute paths of the external tools, keyed by tool name.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ToolPaths(HashMap<String, PathBuf>);

impl ToolPaths {
    pub fn new(paths: HashMap<String, PathBuf>) -> ToolPaths {
        ToolPaths(paths)
    }

    pub fn get(&self, name: &str) -> Option<&Path> {
        self.0.get(name).map(|p| p.as_path())
    }
}

/// Process wide settings, fixed once the daemon has started.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub volume_root: PathBuf,
    pub default_pool: String,
    pub default_fs_type: String,
    pub default_size_mb: u64,
    pub tool_paths: ToolPaths,
}

/// A resource left behind by a cleanup or teardown step that failed.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Resource {
    Lock { lock_id: String, locker: String },
    Mapping { device: PathBuf },
    Mount { device: PathBuf },
}

impl Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Lock { lock_id, locker } => write!(f, "lock {lock_id} held by {locker}"),
            Resource::Mapping { device } => write!(f, "mapping at {}", device.display()),
            Resource::Mount { device } => write!(f, "mount of {}", device.display()),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct StrandedResource {
    pub pool: String,
    pub name: String,
    pub mountpoint: Option<PathBuf>,
    pub resource: Resource,
    pub cause: String,
}
