// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Map an ext2/3/4 filesystem into a mapper database.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use ext4map::Ext4Fs;
use fsmap::{Context, FsDriver};

#[derive(Parser)]
#[command(name = "e2mapper", about = "Generate a filemapper database from an ext2/3/4 filesystem")]
struct Args {
    /// Database file to create
    dbfile: PathBuf,
    /// Block device or image holding the filesystem
    device: PathBuf,
}

fn main() -> ExitCode {
    pretty_env_logger::init();
    let args = Args::parse();

    let result = Ext4Fs::open(&args.device)
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
