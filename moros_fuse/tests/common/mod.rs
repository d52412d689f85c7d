use std::path::PathBuf;

use moros_fuse::{FileImage, MorosFs};
use tempfile::TempDir;

/// 8200 blocks of 512 bytes: one bitmap block, 4096 usable data blocks.
pub const BLOCKS: u64 = 8200;
pub const BLOCK_SIZE: u32 = 512;

pub struct Fixture {
    // Keeps the directory alive for the duration of the test.
    _dir: TempDir,
    pub path: PathBuf,
}

impl Fixture {
    pub fn formatted() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let image = FileImage::create(&path, BLOCKS * u64::from(BLOCK_SIZE)).unwrap();
        MorosFs::format(image, BLOCK_SIZE).unwrap().unmount().unwrap();
        Self { _dir: dir, path }
    }

    pub fn mount(&self, writable: bool) -> MorosFs<FileImage> {
        let image = FileImage::open(&self.path, writable).unwrap();
        MorosFs::open(image, BLOCK_SIZE).unwrap()
    }
}
