// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use crate::{
    engine::{
        backend::Backend,
        device, lock,
        rollback::{Rollback, StrandedLedger},
        types::{Resource, StrandedResource},
    },
    rbdvol::{ErrorEnum, RbdVolError, RbdVolResult},
};

/// Whether the pool listing contains an image named exactly name.
pub fn image_exists(backend: &dyn Backend, pool: &str, name: &str) -> RbdVolResult<bool> {
    let images = backend.list_images(pool).map_err(|e| {
        RbdVolError::engine(
            ErrorEnum::Backend,
            format!("Unable to list images in pool {pool}"),
            &e,
        )
    })?;
    Ok(images.iter().any(|image| image == name))
}

/// Create the image and leave it holding an empty filesystem, unlocked
/// and unmapped, ready to be mounted.
pub fn provision(
    backend: &dyn Backend,
    ledger: &StrandedLedger,
    pool: &str,
    name: &str,
    fs_type: &str,
    size_mb: u64,
    lock_id: &str,
) -> RbdVolResult<()> {
    let provision_err = |e: &RbdVolError| {
        RbdVolError::engine(
            ErrorEnum::Provision,
            format!("Unable to provision image {pool}/{name}"),
            e,
        )
    };

    backend
        .create_image(pool, name, size_mb)
        .map_err(|e| provision_err(&e))?;
    info!("Created image {}/{} of {} MB", pool, name, size_mb);

    let locker = lock::acquire(backend, pool, name, lock_id).map_err(|e| provision_err(&e))?;
    let mut rollback = Rollback::new(backend, ledger, pool, name);
    rollback.locked(lock_id, &locker);

    let device = match device::map(backend, pool, name) {
        Ok(device) => device,
        Err(e) => {
            rollback.unwind(&e);
            return Err(provision_err(&e));
        }
    };
    rollback.mapped(&device);

    if let Err(e) = device::format(backend, &device, fs_type) {
        rollback.unwind(&e);
        return Err(provision_err(&e));
    }

    if let Err(e) = device::unmap(backend, &device) {
        // The mapping stays behind, but the lock is still given back.
        rollback.undone();
        ledger.record(StrandedResource {
            pool: pool.to_string(),
            name: name.to_string(),
            mountpoint: None,
            resource: Resource::Mapping {
                device: device.clone(),
            },
            cause: e.to_string(),
        });
        rollback.unwind(&e);
        return Err(provision_err(&e));
    }
    rollback.undone();
    rollback.commit();

    lock::release(backend, pool, name, lock_id, &locker).map_err(|e| {
        ledger.record(StrandedResource {
            pool: pool.to_string(),
            name: name.to_string(),
            mountpoint: None,
            resource: Resource::Lock {
                lock_id: lock_id.to_string(),
                locker: locker.clone(),
            },
            cause: e.to_string(),
        });
        provision_err(&e)
    })?;

    info!("Provisioned image {}/{} with {} filesystem", pool, name, fs_type);
    Ok(())
}
