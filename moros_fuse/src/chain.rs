//! Linked block chains.
//!
//! The first 4 bytes of a chained block hold the block number of the next
//! block (0 ends the chain); the rest is payload.

use tracing::{debug, warn};

use crate::bitmap;
use crate::error::{FsError, Result};
use crate::geometry::Geometry;
use crate::image::Image;

const NEXT_LEN: u64 = 4;
/// Offset of `alloc_count` inside the superblock.
const ALLOC_COUNT_OFFSET: u64 = 14;

/// Byte address of the block following `addr`, or 0 at the end of the chain.
pub fn next_block(image: &impl Image, geometry: &Geometry, addr: u64) -> Result<u64> {
    let next = geometry.block_addr(image.read_u32(addr)?);
    if next != 0 && (next < geometry.data_addr || next >= geometry.end_addr()) {
        return Err(FsError::InvalidAddress { addr: next });
    }
    Ok(next)
}

pub fn set_next_block(image: &mut impl Image, geometry: &Geometry, addr: u64, next: u64) -> Result<()> {
    let block = geometry.block_number(next)?;
    image.write_u32(addr, block)
}

/// Takes the first free block, marks it allocated, zeroes it and bumps the
/// superblock allocation counter.
pub fn alloc_block(image: &mut impl Image, geometry: &Geometry) -> Result<u64> {
    let addr = bitmap::next_free_block(&*image, geometry)?;
    let was_allocated = bitmap::allocate(image, geometry, addr)?;
    image.write_at(addr, &vec![0u8; geometry.block_size as usize])?;
    if !was_allocated {
        let counter = geometry.superblock_addr + ALLOC_COUNT_OFFSET;
        let count = image.read_u32(counter)?;
        image.write_u32(counter, count.saturating_add(1))?;
    }
    debug!(addr, "allocated block");
    Ok(addr)
}

/// Clears the bit of `addr` and lowers the superblock allocation counter
/// if the block was allocated.
pub fn free_block(image: &mut impl Image, geometry: &Geometry, addr: u64) -> Result<()> {
    if bitmap::free(image, geometry, addr)? {
        let counter = geometry.superblock_addr + ALLOC_COUNT_OFFSET;
        let count = image.read_u32(counter)?;
        image.write_u32(counter, count.saturating_sub(1))?;
    }
    debug!(addr, "freed block");
    Ok(())
}

/// Reads `length` bytes at `offset` of the chain starting at `start`,
/// clamped to `total_size`.
pub fn read_range(
    image: &impl Image,
    geometry: &Geometry,
    start: u64,
    total_size: u64,
    offset: u64,
    length: u64,
) -> Result<Vec<u8>> {
    if offset >= total_size || length == 0 {
        return Ok(Vec::new());
    }
    let end = offset.saturating_add(length).min(total_size);
    let payload = geometry.payload_size();
    let mut out = Vec::with_capacity((end - offset) as usize);

    let mut addr = start;
    let mut pos = 0; // file offset of the current block's payload
    while addr != 0 && pos < end {
        let block_end = pos + payload;
        if block_end > offset {
            let from = offset.max(pos);
            let to = end.min(block_end);
            let mut buf = vec![0u8; (to - from) as usize];
            image.read_at(addr + NEXT_LEN + (from - pos), &mut buf)?;
            out.extend_from_slice(&buf);
        }
        pos = block_end;
        if pos < end {
            addr = next_block(image, geometry, addr)?;
        }
    }
    if (out.len() as u64) < end - offset {
        warn!(start, total_size, read = out.len(), "chain ends before recorded size");
    }
    Ok(out)
}

/// Follows the pointer of `addr`, allocating and linking a new block when
/// the chain ends there.
fn next_or_extend(image: &mut impl Image, geometry: &Geometry, addr: u64) -> Result<u64> {
    let next = next_block(&*image, geometry, addr)?;
    if next != 0 {
        return Ok(next);
    }
    let next = alloc_block(image, geometry)?;
    set_next_block(image, geometry, addr, next)?;
    debug!(from = addr, to = next, "extended chain");
    Ok(next)
}

/// Writes `data` at `offset` of the chain starting at `start`, overwriting
/// existing payload and extending the chain as needed.
///
/// An allocation failure part way leaves the blocks written so far in place.
pub fn write_range(
    image: &mut impl Image,
    geometry: &Geometry,
    start: u64,
    offset: u64,
    data: &[u8],
) -> Result<()> {
    if start < geometry.data_addr || start >= geometry.end_addr() {
        return Err(FsError::InvalidAddress { addr: start });
    }
    if data.is_empty() {
        return Ok(());
    }
    let payload = geometry.payload_size();
    let mut addr = start;
    for _ in 0..offset / payload {
        addr = next_or_extend(image, geometry, addr)?;
    }

    let mut in_block = offset % payload;
    let mut written = 0;
    loop {
        let n = ((payload - in_block) as usize).min(data.len() - written);
        image.write_at(addr + NEXT_LEN + in_block, &data[written..written + n])?;
        written += n;
        if written == data.len() {
            return Ok(());
        }
        in_block = 0;
        addr = next_or_extend(image, geometry, addr)?;
    }
}
