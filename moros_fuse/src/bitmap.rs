//! Free-block bitmap.
//!
//! One bit per data block, least significant bit first within each byte.
//! A set bit marks the block as allocated. Every call reads and rewrites at
//! most one bitmap block; nothing is cached between calls.

use tracing::trace;

use crate::error::{FsError, Result};
use crate::geometry::Geometry;
use crate::image::Image;

struct BitPos {
    block_addr: u64,
    byte: usize,
    bit: u32,
}

fn locate(geometry: &Geometry, addr: u64) -> Result<BitPos> {
    let bs = geometry.block_size;
    if addr % bs != 0 || addr < geometry.data_addr || addr >= geometry.end_addr() {
        return Err(FsError::InvalidAddress { addr });
    }
    let index = (addr - geometry.data_addr) / bs;
    let bits = 8 * bs;
    let block_addr = geometry.bitmap_addr + (index / bits) * bs;
    if block_addr >= geometry.data_addr {
        // The bitmap region describes fewer blocks than the image holds.
        return Err(FsError::InvalidAddress { addr });
    }
    Ok(BitPos {
        block_addr,
        byte: ((index % bits) / 8) as usize,
        bit: (index % 8) as u32,
    })
}

pub fn is_allocated(image: &impl Image, geometry: &Geometry, addr: u64) -> Result<bool> {
    let pos = locate(geometry, addr)?;
    let mut byte = [0u8; 1];
    image.read_at(pos.block_addr + pos.byte as u64, &mut byte)?;
    Ok(byte[0] & (1 << pos.bit) != 0)
}

/// Sets or clears the bit of `addr`, returning its previous value.
fn set_bit(image: &mut impl Image, geometry: &Geometry, addr: u64, value: bool) -> Result<bool> {
    let pos = locate(geometry, addr)?;
    let mut block = vec![0u8; geometry.block_size as usize];
    image.read_at(pos.block_addr, &mut block)?;
    let previous = block[pos.byte] & (1 << pos.bit) != 0;
    if value {
        block[pos.byte] |= 1 << pos.bit;
    } else {
        block[pos.byte] &= !(1 << pos.bit);
    }
    image.write_at(pos.block_addr, &block)?;
    Ok(previous)
}

/// Marks `addr` allocated. Setting an already set bit is not an error;
/// the previous value is returned so callers can detect it.
pub fn allocate(image: &mut impl Image, geometry: &Geometry, addr: u64) -> Result<bool> {
    let previous = set_bit(image, geometry, addr, true)?;
    trace!(addr, previous, "bitmap: allocate");
    Ok(previous)
}

pub fn free(image: &mut impl Image, geometry: &Geometry, addr: u64) -> Result<bool> {
    let previous = set_bit(image, geometry, addr, false)?;
    trace!(addr, previous, "bitmap: free");
    Ok(previous)
}

/// Returns the address of the first data block whose bit is clear.
///
/// Linear scan from the start of the bitmap region: cost grows with the
/// number of allocated blocks.
pub fn next_free_block(image: &impl Image, geometry: &Geometry) -> Result<u64> {
    let bs = geometry.block_size;
    let mut block = vec![0u8; bs as usize];
    for i in 0..geometry.bitmap_blocks() {
        image.read_at(geometry.bitmap_addr + i * bs, &mut block)?;
        for (j, &byte) in block.iter().enumerate() {
            if byte == 0xff {
                continue;
            }
            let k = u64::from((!byte).trailing_zeros());
            let index = i * 8 * bs + j as u64 * 8 + k;
            let addr = geometry.data_addr + index * bs;
            if addr >= geometry.end_addr() {
                return Err(FsError::OutOfSpace);
            }
            return Ok(addr);
        }
    }
    Err(FsError::OutOfSpace)
}
