// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Cluster-wide exclusion on an image, delegated to the RBD lock primitive.
// A lock taken here must be released with the exact locker token that the
// cluster reported for it.

use crate::{
    engine::backend::Backend,
    rbdvol::{ErrorEnum, RbdVolError, RbdVolResult},
};

/// Find the locker token of lock_id in the output of a lock listing.
/// The first line is a header and is never considered. Lines have the form
/// `<locker> <lock id> [address]`; the first line whose lock id matches
/// wins.
pub fn parse_locker(listing: &str, lock_id: &str) -> Option<String> {
    listing.lines().skip(1).find_map(|line| {
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next()) {
            (Some(locker), Some(id)) if id == lock_id => Some(locker.to_string()),
            _ => None,
        }
    })
}

/// Lock the image and return the token that identifies this holder.
///
/// If the lock is taken but its holder can not be identified, the lock is
/// left in place and an error is returned; it can not be released without
/// the token.
pub fn acquire(backend: &dyn Backend, pool: &str, name: &str, lock_id: &str) -> RbdVolResult<String> {
    backend.lock_add(pool, name, lock_id).map_err(|e| {
        RbdVolError::engine(
            ErrorEnum::Lock,
            format!("Unable to lock image {pool}/{name}"),
            &e,
        )
    })?;

    let listing = backend.lock_list(pool, name).map_err(|e| {
        RbdVolError::engine(
            ErrorEnum::Lock,
            format!("Unable to list the locks of image {pool}/{name}"),
            &e,
        )
    })?;

    let locker = parse_locker(&listing, lock_id).ok_or_else(|| {
        RbdVolError::Engine(
            ErrorEnum::Lock,
            format!("Unable to find the holder of lock {lock_id} on image {pool}/{name}"),
        )
    })?;
    debug!("Locked image {}/{} as {}", pool, name, locker);
    Ok(locker)
}

pub fn release(
    backend: &dyn Backend,
    pool: &str,
    name: &str,
    lock_id: &str,
    locker: &str,
) -> RbdVolResult<()> {
    backend
        .lock_remove(pool, name, lock_id, locker)
        .map_err(|e| {
            RbdVolError::engine(
                ErrorEnum::Lock,
                format!("Unable to unlock image {pool}/{name} held by {locker}"),
                &e,
            )
        })?;
    debug!("Unlocked image {}/{} held by {}", pool, name, locker);
    Ok(())
}
