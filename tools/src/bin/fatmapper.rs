// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Map a FAT12/16/32 filesystem into a mapper database.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use fatmap::FatFs;
use fsmap::{Context, FsDriver};

#[derive(Parser)]
#[command(name = "fatmapper", about = "Generate a filemapper database from a FAT filesystem")]
struct Args {
    /// Database file to create
    dbfile: PathBuf,
    /// Block device or image holding the filesystem
    device: PathBuf,
}

fn main() -> ExitCode {
    pretty_env_logger::init();
    let args = Args::parse();

    let result = FatFs::open(&args.device)
        .during("opening filesystem")
        .and_then(|mut fs| fs.run(&args.dbfile));
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}: {err}", args.device.display());
            ExitCode::FAILURE
        }
    }
}
