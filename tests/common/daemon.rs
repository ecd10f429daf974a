// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
use assert_cmd::prelude::CommandCargoExt;
use std::{
    panic,
    path::{Path, PathBuf},
    process::{Child, Command},
    thread, time,
};

use tempfile::TempDir;

/// A simulated daemon whose socket, pid file and volume root all live in
/// a private temporary directory.
pub struct SimDaemon {
    child: Child,
    dir: TempDir,
}

impl SimDaemon {
    pub fn socket(&self) -> PathBuf {
        self.dir.path().join("rbd.sock")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.dir.path().join("rbdvold.pid")
    }

    pub fn volume_root(&self) -> PathBuf {
        self.dir.path().join("volumes")
    }

    /// The client binary, pointed at this daemon.
    pub fn client(&self) -> Command {
        let mut cmd = Command::cargo_bin("rbdvol").expect("rbdvol is built for tests");
        cmd.arg("--socket").arg(self.socket());
        cmd
    }
}

fn wait_for(path: &Path) {
    for _ in 0..50 {
        if path.exists() {
            return;
        }
        thread::sleep(time::Duration::from_millis(100));
    }
}

fn start_rbdvold_sim() -> Result<SimDaemon, Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let mut cmd = Command::cargo_bin("rbdvold")?;
    cmd.arg("--sim")
        .arg("--socket")
        .arg(dir.path().join("rbd.sock"))
        .arg("--pid-file")
        .arg(dir.path().join("rbdvold.pid"))
        .arg("--volroot")
        .arg(dir.path().join("volumes"))
        .arg("--fstype")
        .arg("ext4");
    let child = cmd.spawn().expect("rbdvold failed to start");
    wait_for(&dir.path().join("rbd.sock"));
    Ok(SimDaemon { child, dir })
}

fn stop_rbdvold(mut daemon: SimDaemon) -> Result<(), Box<dyn std::error::Error>> {
    daemon.child.kill()?;
    daemon.child.wait()?;
    Ok(())
}

// Run a test with a simulated rbdvold
pub fn test_with_rbdvold_sim<F>(test: F)
where
    F: Fn(&SimDaemon),
{
    let daemon = start_rbdvold_sim().unwrap();

    let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        test(&daemon);
    }));
    let td = stop_rbdvold(daemon);

    result.unwrap();
    td.unwrap();
}
