// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

pub mod client;
mod consts;
mod interface;
mod server;

pub use self::{
    client::RbdVolClient,
    consts::*,
    interface::{RbdVolRequest, RbdVolResponse, VolumeName},
    server::{run_server, RbdVolServer},
};
