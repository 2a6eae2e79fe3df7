#![allow(clippy::redundant_field_names)]

extern crate bstr;
extern crate clap;
extern crate fuse_mt;
extern crate fuser;
extern crate libc;
extern crate nix;
extern crate regex;
#[macro_use]
extern crate log;

mod cli;
mod errors;
mod filesystem;
mod procedure;
mod process;

use std::ffi::OsStr;
use std::process::exit;

use crate::errors::{Errno, Result};
use crate::filesystem::{Mirror, Persistent, ScriptFs};
use crate::procedure::{Procedure, ProcedureList};

/// Threads the host may use to dispatch operations concurrently.
const DISPATCH_THREADS: usize = 8;

fn run() -> Result<()> {
    // step 1: CLI parsing (usage errors exit with EX_USAGE inside)
    let config = cli::parse_config();
    let crate::cli::Config {
        procedures: config_procedures,
        mirror: mirror_path,
        mountpoint,
        fuse_args,
    } = config;

    // step 2: assemble the persistent state
    let mut procedures = config_procedures;
    if procedures.is_empty() {
        // no valid -p: run shebang or executable files as themselves
        procedures.push(Procedure::default_auto());
    }

    let mirror = Mirror::open(&mirror_path).map_err(|error| {
        eprintln!("Can't open mirror folder: {}", mirror_path.display());
        error.with_errno(Errno::EPERM)
    })?;

    let persistent = Persistent::new(
        mirror,
        Persistent::capture_envp(),
        ProcedureList::new(procedures),
    );

    // step 3: hand control to the filesystem host until unmount
    let fuse_args: Vec<&OsStr> = fuse_args.iter().map(OsStr::new).collect();
    let filesystem = fuse_mt::FuseMT::new(ScriptFs::new(persistent), DISPATCH_THREADS);
    fuse_mt::mount(filesystem, &mountpoint, &fuse_args)?;

    Ok(())
}

fn main() {
    env_logger::init();
    if let Err(error) = run() {
        error!("Exited with error: {}", error);
        // a permission failure is the unopenable-mirror case
        exit(match error.get_errno() {
            Errno::EPERM => 77, // sysexits.h EX_NOPERM
            _ => 1,
        });
    }
}
