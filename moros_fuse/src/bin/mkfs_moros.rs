use std::env;
use std::path::PathBuf;
use std::process;

use anyhow::{ensure, Context, Result};
use moros_fuse::{FileImage, MorosFs, DEFAULT_BLOCK_SIZE};
use tracing_subscriber::EnvFilter;

/// Smallest image with a full bitmap block at 512 byte blocks.
const DEFAULT_BLOCKS: u32 = 8195;

fn usage_and_exit(program: &str) -> ! {
    eprintln!("Usage: {program} [--blocks=N] [--blocksize=B] <image>");
    process::exit(2);
}

fn run(image: PathBuf, blocks: u32, block_size: u32) -> Result<()> {
    ensure!(
        block_size >= 512 && block_size.is_power_of_two(),
        "block size {block_size} must be a power of two of at least 512"
    );
    let len = u64::from(blocks) * u64::from(block_size);
    let file = FileImage::create(&image, len)
        .with_context(|| format!("creating '{}'", image.display()))?;
    let fs = MorosFs::format(file, block_size)
        .with_context(|| format!("formatting '{}'", image.display()))?;
    let geometry = *fs.geometry();
    fs.unmount()?;

    println!("MOROS FS created in '{}'", image.display());
    println!("block_size={block_size}, block_count={blocks}");
    println!("Layout:");
    println!("  superblock : {:#x}", geometry.superblock_addr);
    println!("  bitmap     : {:#x} ({} blocks)", geometry.bitmap_addr, geometry.bitmap_blocks());
    println!("  data       : {:#x}", geometry.data_addr);
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();
    let program = args.first().map_or("mkfs_moros", String::as_str);
    let mut blocks = DEFAULT_BLOCKS;
    let mut block_size = DEFAULT_BLOCK_SIZE;
    let mut image = None;
    for arg in args.iter().skip(1) {
        if let Some(rest) = arg.strip_prefix("--blocks=") {
            match rest.parse() {
                Ok(value) => blocks = value,
                Err(_) => {
                    eprintln!("Bad --blocks value");
                    usage_and_exit(program);
                }
            }
        } else if let Some(rest) = arg.strip_prefix("--blocksize=") {
            match rest.parse() {
                Ok(value) => block_size = value,
                Err(_) => {
                    eprintln!("Bad --blocksize value");
                    usage_and_exit(program);
                }
            }
        } else if image.is_none() && !arg.starts_with("--") {
            image = Some(PathBuf::from(arg));
        } else {
            usage_and_exit(program);
        }
    }
    let Some(image) = image else {
        usage_and_exit(program);
    };

    if let Err(err) = run(image, blocks, block_size) {
        eprintln!("Error: {err:#}");
        process::exit(1);
    }
}
