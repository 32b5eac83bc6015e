use bonta_mkimage::{create_image, OsGuidSource};

use anyhow::Context;
use clap::Parser;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

/// Builds a GPT disk image with a single FAT32 partition mirroring a
/// directory tree.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// Directory tree to copy into the FAT32 partition.
    input_directory: PathBuf,

    /// Raw image file to produce; overwritten if it already exists.
    output_image: PathBuf,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let image = File::create(&args.output_image)
        .with_context(|| format!("can not create {}", args.output_image.display()))?;
    let mut image = BufWriter::new(image);

    create_image(&args.input_directory, &mut image, &mut OsGuidSource)
        .context("failed to build the disk image")?;
    image.flush().context("failed to flush the output image")?;

    Ok(())
}
