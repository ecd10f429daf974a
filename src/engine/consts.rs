// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/// The lock id taken on every image while it is in use on some host.
pub const LOCK_ID: &str = "dockerLock";

pub const DEFAULT_VOLUME_ROOT: &str = "/var/lib/docker-volumes/rbd";
pub const DEFAULT_POOL: &str = "rbd";
pub const DEFAULT_FS_TYPE: &str = "xfs";
pub const DEFAULT_SIZE_MB: u64 = 1024;
