use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use slotphot_core::io::npy::NpyFile;

#[derive(Args)]
pub struct InfoArgs {
    /// Input cube (.npy)
    pub file: PathBuf,
}

pub fn run(args: &InfoArgs) -> Result<()> {
    let file = NpyFile::open(&args.file)
        .with_context(|| format!("Failed to open cube {}", args.file.display()))?;
    let header = &file.header;
    let shape = file.shape();

    println!("File:        {}", args.file.display());
    println!("Shape:       {:?}", shape);
    println!("Element:     {:?} ({} bytes)", header.dtype, header.dtype.size());
    println!(
        "Byte order:  {}",
        if header.little_endian { "little" } else { "big" }
    );
    match shape {
        [n, h, w] => {
            println!("Frames:      {}", n);
            println!("Dimensions:  {}x{}", w, h);
        }
        [n, c, h, w] => {
            println!("Frames:      {}", n);
            println!("Channels:    {} (select one with --channel)", c);
            println!("Dimensions:  {}x{}", w, h);
        }
        _ => println!("Not an image cube (expected 3 or 4 dimensions)"),
    }

    let total: usize = shape.iter().product();
    let total_mb = (total * header.dtype.size()) as f64 / (1024.0 * 1024.0);
    println!("Data size:   {:.1} MB", total_mb);

    Ok(())
}
