//! Command-line extractor for AIME venue data embedded in `.aivu` files.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use aime_extract::AimeExtractor;
use anyhow::{bail, Context, Result};
use clap::Parser;
use log::debug;

use std::fs;
use std::path::PathBuf;

/// Extract embedded AIME venue data from an Apple Immersive Video file.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Source .aivu QuickTime file
    input: PathBuf,

    /// Destination .aime file
    output: PathBuf,

    /// Overwrite the destination if it already exists
    #[arg(long)]
    force: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    if !args.input.exists() {
        bail!("Input file not found: {}", args.input.display());
    }
    if args.output.exists() && !args.force {
        bail!("Output file already exists: {}", args.output.display());
    }

    let data = fs::read(&args.input)
        .with_context(|| format!("Failed to read {}", args.input.display()))?;
    debug!("read {} bytes from {}", data.len(), args.input.display());

    let extractor = AimeExtractor::from_bytes(&data).context("Failed to extract AIME")?;
    let bounds = extractor.bounds();

    if let Some(parent) = args.output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| {
            format!("Unable to create output directory at {}", parent.display())
        })?;
    }
    fs::write(&args.output, extractor.payload())
        .with_context(|| format!("Failed to write {}", args.output.display()))?;

    println!(
        "Extracted AIME: offset=0x{:x}, length={} bytes → {}",
        bounds.offset,
        bounds.length,
        args.output.display()
    );
    Ok(())
}
