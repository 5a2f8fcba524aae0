// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Convert a mapper database between pristine and compressed forms.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use compdb::{shrink_file, Codec, Target};

#[derive(Parser)]
#[command(
    name = "shrinkdb",
    about = "Recompress a database file with a different codec, or none"
)]
struct Args {
    /// Source database
    infile: PathBuf,
    /// Destination; overwritten if present
    outfile: PathBuf,
    /// Target codec name, or NONE to decompress; defaults to the first
    /// registry entry
    codec: Option<String>,
}

fn main() -> ExitCode {
    pretty_env_logger::init();
    let args = Args::parse();

    let target = match args.codec.as_deref() {
        Some("NONE") => Ok(Target::Pristine),
        name => Codec::find(name).map(Target::Codec),
    };
    let result = target.and_then(|target| shrink_file(&args.infile, &args.outfile, target));
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!(
                "{}: {err} (codecs: {})",
                args.infile.display(),
                Codec::list()
            );
            ExitCode::FAILURE
        }
    }
}
