// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

pub use self::{
    backend::Backend,
    consts::{DEFAULT_FS_TYPE, DEFAULT_POOL, DEFAULT_SIZE_MB, DEFAULT_VOLUME_ROOT, LOCK_ID},
    engine::VolumeEngine,
    lock::parse_locker,
    names::parse_volume_spec,
    rbd_engine::{discover_tools, RbdBackend},
    registry::VolumeRegistry,
    sim_engine::{BackendCall, SimBackend, SimOp},
    types::{
        DriverConfig, Resource, StrandedResource, ToolPaths, VolumeSpec, VolumeState,
    },
};

mod backend;
mod consts;
mod device;
#[allow(clippy::module_inception)]
mod engine;
mod image;
mod lock;
mod names;
mod rbd_engine;
mod registry;
mod rollback;
mod sim_engine;
mod types;
