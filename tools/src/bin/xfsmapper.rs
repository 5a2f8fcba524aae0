// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Map an XFS filesystem into a mapper database.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use fsmap::{Context, FsDriver};
use xfsmap::XfsFs;

#[derive(Parser)]
#[command(name = "xfsmapper", about = "Generate a filemapper database from an XFS filesystem")]
struct Args {
    /// Database file to create
    dbfile: PathBuf,
    /// Block device or image holding the filesystem
    device: PathBuf,
    /// External log device
    #[arg(short = 'l', value_name = "logdev")]
    logdev: Option<PathBuf>,
    /// The device is a disk image file rather than a block device
    #[arg(short = 'f')]
    image_file: bool,
}

fn main() -> ExitCode {
    pretty_env_logger::init();
    let args = Args::parse();

    if args.image_file {
        log::debug!("treating {} as a disk image", args.device.display());
    }
    if let Some(logdev) = &args.logdev {
        // Only the data device holds mappable blocks; an external log
        // just means the journal file is absent from the database.
        log::info!("external log on {}; journal extents will be skipped", logdev.display());
    }

    let result = XfsFs::open(&args.device)
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
