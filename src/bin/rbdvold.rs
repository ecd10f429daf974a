// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    env,
    error::Error,
    fs::{File, OpenOptions},
    io::{Read, Seek, Write},
    path::{Path, PathBuf},
    str::FromStr,
};

use clap::{Arg, ArgAction, Command};
use env_logger::Builder;
use log::LevelFilter;
use nix::{
    fcntl::{Flock, FlockArg},
    unistd::getpid,
};

use rbdvol::{
    engine::{DEFAULT_FS_TYPE, DEFAULT_POOL, DEFAULT_SIZE_MB, DEFAULT_VOLUME_ROOT},
    jsonrpc::RPC_SOCKADDR,
    rbdvol::{run, DaemonOptions, RbdVolError, RbdVolResult, VERSION},
};

const RBDVOLD_PID_PATH: &str = "/run/rbdvold.pid";

fn parse_args() -> Command {
    Command::new("rbdvold")
        .version(VERSION)
        .about("Lifecycle manager for RBD backed container volumes")
        .arg(
            Arg::new("log_level")
                .long("log-level")
                .action(ArgAction::Set)
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .help("Sets level for generation of log messages"),
        )
        .arg(
            Arg::new("sim")
                .long("sim")
                .action(ArgAction::SetTrue)
                .help("Use a simulated cluster instead of the rbd tools"),
        )
        .arg(
            Arg::new("volroot")
                .long("volroot")
                .value_parser(clap::value_parser!(PathBuf))
                .default_value(DEFAULT_VOLUME_ROOT)
                .help("Directory under which volumes are mounted"),
        )
        .arg(
            Arg::new("pool")
                .long("pool")
                .default_value(DEFAULT_POOL)
                .help("Pool used for names that do not specify one"),
        )
        .arg(
            Arg::new("fstype")
                .long("fstype")
                .default_value(DEFAULT_FS_TYPE)
                .help("Filesystem created on new images"),
        )
        .arg(
            Arg::new("size")
                .long("size")
                .value_parser(clap::value_parser!(u64).range(1..))
                .help("Size in MB of new images whose name gives no size [default: 1024]"),
        )
        .arg(
            Arg::new("socket")
                .long("socket")
                .value_parser(clap::value_parser!(PathBuf))
                .default_value(RPC_SOCKADDR)
                .help("Path of the control socket"),
        )
        .arg(
            Arg::new("pid_file")
                .long("pid-file")
                .value_parser(clap::value_parser!(PathBuf))
                .default_value(RBDVOLD_PID_PATH)
                .help("Path of the file that holds the daemon's pid"),
        )
}

/// To ensure only one instance of rbdvold runs at a time, acquire an
/// exclusive lock. Return an error if lock attempt fails.
fn trylock_pid_file(path: &Path) -> RbdVolResult<Flock<File>> {
    let f = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|err| {
            RbdVolError::Chained(
                format!("Failed to create or open the rbdvold PID file at {}", path.display()),
                Box::new(RbdVolError::from(err)),
            )
        })?;
    match Flock::lock(f, FlockArg::LockExclusiveNonblock) {
        Ok(mut locked) => {
            locked.set_len(0)?;
            locked.rewind()?;
            locked.write_all(getpid().to_string().as_bytes())?;
            Ok(locked)
        }
        Err((mut f, _)) => {
            let mut buf = String::new();

            if f.read_to_string(&mut buf).is_err() {
                buf = "<unreadable>".to_string();
            }

            Err(RbdVolError::Msg(format!(
                "Daemon already running with supposed pid: {buf}"
            )))
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args().get_matches();

    let mut builder = Builder::new();
    if let Some(log_level) = args.get_one::<String>("log_level") {
        builder.filter(
            Some("rbdvol"),
            LevelFilter::from_str(log_level)
                .expect("argument parser only accepts valid log levels"),
        );
    } else if let Ok(s) = env::var("RUST_LOG") {
        builder.parse_filters(&s);
    }
    builder.init();

    let pid_file = args
        .get_one::<PathBuf>("pid_file")
        .expect("has a default value");
    let _rbdvold_file = trylock_pid_file(pid_file)?;

    run(DaemonOptions {
        volume_root: args
            .get_one::<PathBuf>("volroot")
            .expect("has a default value")
            .clone(),
        pool: args
            .get_one::<String>("pool")
            .expect("has a default value")
            .clone(),
        fs_type: args
            .get_one::<String>("fstype")
            .expect("has a default value")
            .clone(),
        size_mb: args
            .get_one::<u64>("size")
            .copied()
            .unwrap_or(DEFAULT_SIZE_MB),
        socket: args
            .get_one::<PathBuf>("socket")
            .expect("has a default value")
            .clone(),
        sim: args.get_flag("sim"),
    })?;
    Ok(())
}
