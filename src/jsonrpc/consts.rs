// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/// Docker discovers volume plugins by the sockets in this directory.
pub const RPC_SOCKADDR: &str = "/run/docker/plugins/rbd.sock";

pub const PLUGIN_CONTENT_TYPE: &str = "application/vnd.docker.plugins.v1+json";

/// The plugin subsystem this daemon implements, as announced on activation.
pub const VOLUME_DRIVER: &str = "VolumeDriver";

/// Upper bound on the size of a request body.
pub const MAX_MESSAGE_SIZE: usize = 65536;
