// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Undo records for a partially completed attach sequence. Steps are
// undone in the reverse of the order in which they were recorded. An undo
// step that fails does not stop the remaining ones and never replaces the
// error that caused the roll back; it is logged and kept in the stranded
// ledger instead.

use std::{
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::{
    engine::{
        backend::Backend,
        device, lock,
        types::{Resource, StrandedResource},
    },
    rbdvol::RbdVolError,
};

/// Every resource that a failed undo or teardown step left behind. A
/// resource appears at most once; a repeated failure refreshes its cause.
#[derive(Debug, Default)]
pub struct StrandedLedger(Mutex<Vec<StrandedResource>>);

impl StrandedLedger {
    fn entries_mut(&self) -> MutexGuard<'_, Vec<StrandedResource>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, stranded: StrandedResource) {
        warn!(
            "Image {}/{}: {} was left behind and needs manual cleanup: {}",
            stranded.pool, stranded.name, stranded.resource, stranded.cause
        );
        let mut entries = self.entries_mut();
        match entries.iter_mut().find(|e| {
            e.pool == stranded.pool
                && e.name == stranded.name
                && e.mountpoint == stranded.mountpoint
                && e.resource == stranded.resource
        }) {
            Some(existing) => existing.cause = stranded.cause,
            None => entries.push(stranded),
        }
    }

    /// Drop the entries of a mountpoint whose volume has since been torn
    /// down completely.
    pub fn clear_mountpoint(&self, mountpoint: &Path) {
        let mut entries = self.entries_mut();
        let before = entries.len();
        entries.retain(|e| e.mountpoint.as_deref() != Some(mountpoint));
        if entries.len() != before {
            info!(
                "Cleared {} stranded resource(s) at {}",
                before - entries.len(),
                mountpoint.display()
            );
        }
    }

    pub fn entries(&self) -> Vec<StrandedResource> {
        self.entries_mut().clone()
    }
}

#[derive(Debug)]
enum Undo {
    Unlock { lock_id: String, locker: String },
    Unmap { device: PathBuf },
    Unmount { device: PathBuf },
}

pub struct Rollback<'a> {
    backend: &'a dyn Backend,
    ledger: &'a StrandedLedger,
    pool: &'a str,
    name: &'a str,
    mountpoint: Option<&'a Path>,
    steps: Vec<Undo>,
}

impl<'a> Rollback<'a> {
    pub fn new(
        backend: &'a dyn Backend,
        ledger: &'a StrandedLedger,
        pool: &'a str,
        name: &'a str,
    ) -> Rollback<'a> {
        Rollback {
            backend,
            ledger,
            pool,
            name,
            mountpoint: None,
            steps: Vec::new(),
        }
    }

    pub fn at_mountpoint(mut self, mountpoint: &'a Path) -> Rollback<'a> {
        self.mountpoint = Some(mountpoint);
        self
    }

    pub fn locked(&mut self, lock_id: &str, locker: &str) {
        self.steps.push(Undo::Unlock {
            lock_id: lock_id.to_string(),
            locker: locker.to_string(),
        });
    }

    pub fn mapped(&mut self, device: &Path) {
        self.steps.push(Undo::Unmap {
            device: device.to_owned(),
        });
    }

    pub fn mounted(&mut self, device: &Path) {
        self.steps.push(Undo::Unmount {
            device: device.to_owned(),
        });
    }

    /// Forget the most recent step because the caller has undone it.
    pub fn undone(&mut self) {
        self.steps.pop();
    }

    /// The sequence completed; nothing is to be undone.
    pub fn commit(self) {}

    /// Undo all recorded steps, newest first. Returns the number of steps
    /// that could not be undone.
    pub fn unwind(self, cause: &RbdVolError) -> usize {
        info!(
            "Rolling back {} step(s) on image {}/{} after: {}",
            self.steps.len(),
            self.pool,
            self.name,
            cause
        );
        let mut failures = 0;
        for step in self.steps.iter().rev() {
            let (res, resource) = match step {
                Undo::Unmount { device } => (
                    device::unmount(self.backend, device),
                    Resource::Mount {
                        device: device.clone(),
                    },
                ),
                Undo::Unmap { device } => (
                    device::unmap(self.backend, device),
                    Resource::Mapping {
                        device: device.clone(),
                    },
                ),
                Undo::Unlock { lock_id, locker } => (
                    lock::release(self.backend, self.pool, self.name, lock_id, locker),
                    Resource::Lock {
                        lock_id: lock_id.clone(),
                        locker: locker.clone(),
                    },
                ),
            };
            if let Err(e) = res {
                failures += 1;
                self.ledger.record(StrandedResource {
                    pool: self.pool.to_string(),
                    name: self.name.to_string(),
                    mountpoint: self.mountpoint.map(|p| p.to_owned()),
                    resource,
                    cause: format!("{e}; while rolling back after: {cause}"),
                });
            }
        }
        failures
    }
}
