//! Superblock parsing and the derived on-disk layout.
//!
//! ```text
//! 0 ......................... superblock_addr    (4096 blocks reserved)
//! superblock_addr ........... 2 blocks           (superblock + spare)
//! bitmap_addr ............... one bit per data block
//! data_addr ................. root directory block, then data blocks
//! ```

use crate::error::{FsError, Result};

pub const SIGNATURE: &[u8; 8] = b"MOROS FS";
pub const VERSION: u8 = 1;
pub const DEFAULT_BLOCK_SIZE: u32 = 512;

/// Blocks preceding the superblock, reserved for the boot and kernel area.
const RESERVED_BLOCKS: u64 = 4096;
/// signature + version + block size code + block count + alloc count
const SUPERBLOCK_LEN: usize = 8 + 1 + 1 + 4 + 4;

/// Byte offset of the superblock for a given block size.
pub fn superblock_addr(block_size: u32) -> u64 {
    RESERVED_BLOCKS * u64::from(block_size)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub block_size: u32,
    pub block_count: u32,
    pub alloc_count: u32,
}

impl Superblock {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < SUPERBLOCK_LEN {
            return Err(FsError::InvalidImage(format!(
                "superblock truncated to {} bytes",
                buf.len()
            )));
        }
        if &buf[0..8] != SIGNATURE {
            return Err(FsError::InvalidImage("bad signature".to_owned()));
        }
        if buf[8] != VERSION {
            return Err(FsError::InvalidImage(format!("unsupported version {}", buf[8])));
        }
        let code = u32::from(buf[9]);
        let block_size = 2u32
            .checked_shl(8 + code)
            .filter(|&size| size != 0)
            .ok_or_else(|| FsError::InvalidImage(format!("bad block size code {code}")))?;
        Ok(Self {
            block_size,
            block_count: u32::from_be_bytes([buf[10], buf[11], buf[12], buf[13]]),
            alloc_count: u32::from_be_bytes([buf[14], buf[15], buf[16], buf[17]]),
        })
    }

    pub fn encode(&self) -> [u8; SUPERBLOCK_LEN] {
        debug_assert!(self.block_size >= 512 && self.block_size.is_power_of_two());
        let mut buf = [0u8; SUPERBLOCK_LEN];
        buf[0..8].copy_from_slice(SIGNATURE);
        buf[8] = VERSION;
        buf[9] = (self.block_size.trailing_zeros() - 9) as u8; // 2 ^ (9 + n)
        buf[10..14].copy_from_slice(&self.block_count.to_be_bytes());
        buf[14..18].copy_from_slice(&self.alloc_count.to_be_bytes());
        buf
    }
}

/// Byte addresses of the image regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub block_size: u64,
    pub block_count: u64,
    pub superblock_addr: u64,
    pub bitmap_addr: u64,
    pub data_addr: u64,
}

impl Geometry {
    /// Derives the layout, rejecting a superblock that disagrees with the
    /// configured block size or leaves no room for a bitmap block.
    pub fn new(superblock: &Superblock, block_size: u32) -> Result<Self> {
        if superblock.block_size != block_size {
            return Err(FsError::InvalidImage(format!(
                "block size {} does not match configured {}",
                superblock.block_size, block_size
            )));
        }
        let bs = u64::from(block_size);
        let block_count = u64::from(superblock.block_count);
        let superblock_addr = superblock_addr(block_size);
        let bitmap_addr = superblock_addr + 2 * bs;

        let bits = 8 * bs; // bits per bitmap block
        let first_bitmap_block = bitmap_addr / bs;
        if block_count <= first_bitmap_block {
            return Err(FsError::InvalidImage(format!(
                "{block_count} blocks leave no room past the superblock"
            )));
        }
        let rest = (block_count - first_bitmap_block) * bits / (bits + 1);
        let bitmap_blocks = rest / bits;
        if bitmap_blocks == 0 {
            return Err(FsError::InvalidImage(format!(
                "{block_count} blocks leave no room for the bitmap"
            )));
        }
        Ok(Self {
            block_size: bs,
            block_count,
            superblock_addr,
            bitmap_addr,
            data_addr: bitmap_addr + bitmap_blocks * bs,
        })
    }

    /// Usable bytes per chained block.
    pub fn payload_size(&self) -> u64 {
        self.block_size - 4
    }

    /// First byte past the last block of the image.
    pub fn end_addr(&self) -> u64 {
        self.block_count * self.block_size
    }

    pub fn bitmap_blocks(&self) -> u64 {
        (self.data_addr - self.bitmap_addr) / self.block_size
    }

    pub fn block_addr(&self, block: u32) -> u64 {
        u64::from(block) * self.block_size
    }

    pub fn block_number(&self, addr: u64) -> Result<u32> {
        if addr % self.block_size != 0 {
            return Err(FsError::InvalidAddress { addr });
        }
        u32::try_from(addr / self.block_size).map_err(|_| FsError::InvalidAddress { addr })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn superblock(block_count: u32) -> Superblock {
        Superblock { block_size: 512, block_count, alloc_count: 0 }
    }

    #[test]
    fn smallest_image_gets_one_bitmap_block() {
        let geometry = Geometry::new(&superblock(8195), 512).unwrap();
        assert_eq!(geometry.superblock_addr, 4096 * 512);
        assert_eq!(geometry.bitmap_addr, 4098 * 512);
        assert_eq!(geometry.data_addr, 4099 * 512);
        assert_eq!(geometry.bitmap_blocks(), 1);
        assert_eq!(geometry.payload_size(), 508);

        let err = Geometry::new(&superblock(8194), 512).unwrap_err();
        assert!(matches!(err, FsError::InvalidImage(_)));
    }

    #[test]
    fn data_addr_follows_reference_formula() {
        // 32 MiB image
        let geometry = Geometry::new(&superblock(65536), 512).unwrap();
        let rest = (65536 - 4098) * 4096 / 4097;
        assert_eq!(geometry.data_addr, (4098 + rest / 4096) * 512);
        assert_eq!(geometry.data_addr % 512, 0);
        assert!(geometry.data_addr >= geometry.bitmap_addr + 512);
    }

    #[test]
    fn parse_is_idempotent() {
        let bytes = Superblock { block_size: 1024, block_count: 20_000, alloc_count: 7 }.encode();
        let first = Geometry::new(&Superblock::parse(&bytes).unwrap(), 1024).unwrap();
        let second = Geometry::new(&Superblock::parse(&bytes).unwrap(), 1024).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.superblock_addr, 4096 * 1024);
        assert_eq!(first.bitmap_addr, 4098 * 1024);
        let rest = (20_000 - 4098) * 8192 / 8193;
        assert_eq!(first.data_addr, (4098 + rest / 8192) * 1024);
        assert_eq!(first.bitmap_blocks(), 1);
        assert_eq!(Superblock::parse(&bytes).unwrap().alloc_count, 7);
        assert_eq!(bytes[9], 1);
    }

    #[test]
    fn rejects_bad_signature_version_and_block_size() {
        let mut bytes = superblock(9000).encode();
        assert_eq!(&bytes[10..14], &9000u32.to_be_bytes());

        bytes[8] = 2;
        assert!(matches!(Superblock::parse(&bytes), Err(FsError::InvalidImage(_))));
        bytes[8] = VERSION;

        bytes[0] = b'm';
        assert!(matches!(Superblock::parse(&bytes), Err(FsError::InvalidImage(_))));
        bytes[0] = b'M';

        let parsed = Superblock::parse(&bytes).unwrap();
        assert!(matches!(Geometry::new(&parsed, 4096), Err(FsError::InvalidImage(_))));

        bytes[9] = 200;
        assert!(matches!(Superblock::parse(&bytes), Err(FsError::InvalidImage(_))));
        assert!(matches!(Superblock::parse(&bytes[..10]), Err(FsError::InvalidImage(_))));
    }

    #[test]
    fn block_number_conversion() {
        let geometry = Geometry::new(&superblock(8195), 512).unwrap();
        assert_eq!(geometry.block_number(geometry.data_addr).unwrap(), 4099);
        assert_eq!(geometry.block_addr(4099), geometry.data_addr);
        assert!(matches!(
            geometry.block_number(geometry.data_addr + 1),
            Err(FsError::InvalidAddress { .. })
        ));
    }
}
