// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Decodes the volume names handed to us by the container runtime.

use regex::Regex;

use crate::{
    engine::types::{DriverConfig, VolumeSpec},
    rbdvol::{ErrorEnum, RbdVolError, RbdVolResult},
};

// [pool/]name[@size]; the size suffix is checked numerically afterwards so
// that a non-numeric size degrades to the default rather than failing.
lazy_static! {
    static ref VOLUME_SPEC: Regex =
        Regex::new(r"^(?:([-_.[:alnum:]]+)/)?([-_.[:alnum:]]+)(?:@([[:alnum:]]*))?$")
            .expect("regex is a valid constant");
}

fn is_dot_component(s: &str) -> bool {
    s == "." || s == ".."
}

/// Parse a volume specification, filling in the configured default pool
/// and size where they are omitted.
pub fn parse_volume_spec(src: &str, config: &DriverConfig) -> RbdVolResult<VolumeSpec> {
    let captures = VOLUME_SPEC.captures(src).ok_or_else(|| {
        RbdVolError::Engine(
            ErrorEnum::Parse,
            format!("Unable to parse volume name \"{src}\""),
        )
    })?;

    let pool = captures
        .get(1)
        .map_or_else(|| config.default_pool.clone(), |m| m.as_str().to_string());
    let name = captures
        .get(2)
        .map(|m| m.as_str().to_string())
        .expect("name group is not optional");

    if is_dot_component(&pool) || is_dot_component(&name) {
        return Err(RbdVolError::Engine(
            ErrorEnum::Parse,
            format!("Volume name \"{src}\" may not use \".\" or \"..\" as a component"),
        ));
    }

    let size_mb = match captures.get(3).map(|m| m.as_str()) {
        Some(size) if !size.is_empty() => match size.parse::<u64>() {
            Ok(size) if size > 0 => size,
            _ => {
                debug!(
                    "Size \"{}\" of volume {} is not a positive integer; using default of {} MB",
                    size, src, config.default_size_mb
                );
                config.default_size_mb
            }
        },
        _ => config.default_size_mb,
    };

    Ok(VolumeSpec {
        pool,
        name,
        size_mb,
    })
}
