use std::env;
use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use moros_fuse::{filesystem, FileImage, MorosFs, MountOptions, DEFAULT_BLOCK_SIZE};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn usage_and_exit(program: &str) -> ! {
    eprintln!("Usage: {program} <image> <mountpoint> [--rw] [--allow-other] [--blocksize=N]");
    process::exit(2);
}

struct Args {
    image: PathBuf,
    mountpoint: PathBuf,
    options: MountOptions,
    block_size: u32,
}

fn parse_args(args: &[String]) -> Option<Args> {
    let mut options = MountOptions::default();
    let mut block_size = DEFAULT_BLOCK_SIZE;
    let mut positional = Vec::new();
    for arg in args.iter().skip(1) {
        if arg == "--rw" {
            options.read_write = true;
        } else if arg == "--allow-other" {
            options.allow_other = true;
        } else if let Some(rest) = arg.strip_prefix("--blocksize=") {
            match rest.parse() {
                Ok(value) => block_size = value,
                Err(_) => {
                    eprintln!("Bad --blocksize value");
                    return None;
                }
            }
        } else if arg.starts_with("--") {
            eprintln!("Unknown option {arg}");
            return None;
        } else {
            positional.push(PathBuf::from(arg));
        }
    }
    let [image, mountpoint]: [PathBuf; 2] = positional.try_into().ok()?;
    Some(Args { image, mountpoint, options, block_size })
}

fn run(args: Args) -> Result<()> {
    let image = FileImage::open(&args.image, args.options.read_write)
        .with_context(|| format!("opening image '{}'", args.image.display()))?;
    let fs = MorosFs::open(image, args.block_size)
        .with_context(|| format!("'{}' is not a valid MOROS FS image", args.image.display()))?;

    info!(image = %args.image.display(), mountpoint = %args.mountpoint.display(), "mounting MOROS FS");
    filesystem::mount(fs, &args.mountpoint, args.options)
        .with_context(|| format!("mounting on '{}'", args.mountpoint.display()))
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();
    let program = args.first().map_or("moros_fuse", String::as_str);
    let Some(parsed) = parse_args(&args) else {
        usage_and_exit(program);
    };
    if let Err(err) = run(parsed) {
        eprintln!("Error: {err:#}");
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_flags() {
        let parsed = parse_args(&args(&["moros_fuse", "disk.img", "/mnt", "--rw", "--blocksize=1024"])).unwrap();
        assert_eq!(parsed.image, PathBuf::from("disk.img"));
        assert_eq!(parsed.mountpoint, PathBuf::from("/mnt"));
        assert!(parsed.options.read_write);
        assert!(!parsed.options.allow_other);
        assert_eq!(parsed.block_size, 1024);
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(parse_args(&args(&["moros_fuse", "disk.img"])).is_none());
        assert!(parse_args(&args(&["moros_fuse", "a", "b", "c"])).is_none());
        assert!(parse_args(&args(&["moros_fuse", "a", "b", "--blocksize=x"])).is_none());
        assert!(parse_args(&args(&["moros_fuse", "a", "b", "--bogus"])).is_none());
    }
}
