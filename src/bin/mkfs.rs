use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use blockhouse::format::{mkfs, MkfsParams};

#[derive(Parser, Debug)]
#[command(name = "blockhouse-mkfs", about = "Initialize a blockhouse volume")]
struct Args {
    /// Metadata block device or image file to initialize
    #[arg(long)]
    device: PathBuf,

    /// Metadata size in 4 KiB blocks
    #[arg(long, default_value_t = 65536)]
    meta_blocks: u64,

    /// Data size in 4 KiB blocks
    #[arg(long, default_value_t = 1 << 20)]
    data_blocks: u64,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let sup = mkfs(
        &args.device,
        MkfsParams { meta_blocks: args.meta_blocks, data_blocks: args.data_blocks },
    )
    .with_context(|| format!("initializing {}", args.device.display()))?;

    println!(
        "{}: fsid {:#018x}, {} meta blocks, {} data blocks",
        args.device.display(),
        sup.hdr.fsid,
        args.meta_blocks,
        args.data_blocks
    );
    Ok(())
}
