// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    path::{Path, PathBuf},
    process::exit,
};

use clap::{Arg, ArgMatches, Command};

use rbdvol::{
    jsonrpc::{client::request, RbdVolRequest, VolumeName, RPC_SOCKADDR},
    rbdvol::{RbdVolResult, VERSION},
};

const VOLUME_COMMANDS: [(&str, &str, fn(VolumeName) -> RbdVolRequest); 5] = [
    (
        "create",
        "Make sure an image exists for the volume",
        RbdVolRequest::Create,
    ),
    ("remove", "Acknowledge removal; the image is kept", RbdVolRequest::Remove),
    ("path", "Print the volume's mountpoint", RbdVolRequest::Path),
    ("mount", "Lock, map and mount the volume", RbdVolRequest::Mount),
    (
        "unmount",
        "Unmount, unmap and unlock the volume",
        RbdVolRequest::Unmount,
    ),
];

fn parse_args() -> Command {
    let volume_commands = VOLUME_COMMANDS.iter().map(|(name, about, _)| {
        Command::new(*name).about(*about).arg(
            Arg::new("name")
                .required(true)
                .value_name("NAME")
                .help("Volume name of the form [pool/]name[@size]"),
        )
    });
    Command::new("rbdvol")
        .version(VERSION)
        .about("Client for the rbdvold volume daemon")
        .arg(
            Arg::new("socket")
                .long("socket")
                .global(true)
                .value_parser(clap::value_parser!(PathBuf))
                .default_value(RPC_SOCKADDR)
                .help("Path of the daemon's control socket"),
        )
        .subcommand_required(true)
        .subcommands(volume_commands)
        .subcommand(Command::new("report").about("Print live volumes and stranded resources"))
}

fn run_command(socket: &Path, args: &ArgMatches) -> RbdVolResult<()> {
    match args.subcommand() {
        Some(("report", _)) => {
            let response = request(socket, RbdVolRequest::Report)?;
            if let Some(report) = response.report {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            Ok(())
        }
        Some((subcommand, sub_m)) => {
            let make = VOLUME_COMMANDS
                .iter()
                .find(|(name, _, _)| *name == subcommand)
                .map(|(_, _, make)| *make)
                .expect("parser only accepts known subcommands");
            let name = sub_m
                .get_one::<String>("name")
                .expect("'name' is a mandatory argument");
            let response = request(socket, RbdVolRequest::volume(make, name.as_str()))?;
            if let Some(mountpoint) = response.mountpoint {
                println!("{}", mountpoint.display());
            }
            Ok(())
        }
        None => unreachable!("a subcommand is required"),
    }
}

fn main() {
    let args = parse_args().get_matches();
    let socket = args
        .get_one::<PathBuf>("socket")
        .expect("has a default value")
        .clone();
    if let Err(e) = run_command(&socket, &args) {
        eprintln!("{e}");
        exit(1);
    }
}
