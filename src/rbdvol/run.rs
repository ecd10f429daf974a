// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Main loop

use std::{
    fs::remove_file,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use tokio::{runtime::Builder, select, signal, task};

use crate::{
    engine::{discover_tools, Backend, DriverConfig, RbdBackend, SimBackend, ToolPaths, VolumeEngine},
    jsonrpc::run_server,
    rbdvol::{errors::RbdVolResult, VERSION},
};

/// Settings of a daemon instance, as given on the command line.
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub volume_root: PathBuf,
    pub pool: String,
    pub fs_type: String,
    pub size_mb: u64,
    pub socket: PathBuf,
    pub sim: bool,
}

// Waits for SIGINT.
async fn signal_thread() {
    if let Err(e) = signal::ctrl_c().await {
        error!("Failure while listening for signals: {}", e);
    }
}

// Resolve the external tools unless simulating, and build the backend.
fn backend(opts: &DaemonOptions) -> RbdVolResult<(ToolPaths, Arc<dyn Backend>)> {
    if opts.sim {
        info!("Using SimBackend");
        Ok((ToolPaths::default(), Arc::new(SimBackend::default())))
    } else {
        info!("Using RbdBackend");
        let tools = discover_tools(&opts.fs_type)?;
        Ok((tools.clone(), Arc::new(RbdBackend::new(tools))))
    }
}

/// Initialize the engine and serve requests until a signal is received
/// or a fatal error is encountered.
/// If opts.sim is true, use the simulated backend rather than the real
/// cluster.
pub fn run(opts: DaemonOptions) -> RbdVolResult<()> {
    info!("rbdvol daemon version {} started", VERSION);
    let (tool_paths, backend) = match backend(&opts) {
        Ok(b) => b,
        Err(e) => {
            error!("Failed to start up the volume engine: {}; exiting", e);
            return Err(e);
        }
    };
    let engine = Arc::new(VolumeEngine::new(
        DriverConfig {
            volume_root: opts.volume_root,
            default_pool: opts.pool,
            default_fs_type: opts.fs_type,
            default_size_mb: opts.size_mb,
            tool_paths,
        },
        backend,
    ));

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .thread_name_fn(|| {
            static ATOMIC_ID: AtomicUsize = AtomicUsize::new(0);
            let id = ATOMIC_ID.fetch_add(1, Ordering::SeqCst);
            format!("rbdvol-wt-{id}")
        })
        .on_thread_start(|| {
            debug!("{:?}: thread started", std::thread::current().name());
        })
        .on_thread_stop(|| {
            debug!("{:?}: thread finished", std::thread::current().name());
        })
        .build()?;

    let socket = opts.socket;
    runtime.block_on(async {
        let join_ipc = task::spawn(run_server(engine, socket.clone()));
        let join_signal = task::spawn(signal_thread());

        select! {
            res = join_ipc => {
                match res {
                    Ok(Err(e)) => {
                        error!("The IPC thread exited with an error: {}; shutting down...", e);
                        return Err(e);
                    }
                    _ => error!("The IPC thread exited; shutting down..."),
                }
            }
            _ = join_signal => {
                info!("Caught SIGINT; exiting...");
            }
        }
        Ok(())
    })?;

    if let Err(e) = remove_file(&socket) {
        warn!("Failed to remove socket {}: {}", socket.display(), e);
    }
    Ok(())
}
