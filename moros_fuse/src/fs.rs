//! Path level operations over a mounted image.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info};

use crate::bitmap;
use crate::chain;
use crate::dir::{self, Node, ReadDir};
use crate::entry::Kind;
use crate::error::{FsError, Result};
use crate::geometry::{self, Geometry, Superblock};
use crate::image::Image;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub kind: Kind,
    pub size: u64,
    pub mtime: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    pub block_size: u64,
    pub block_count: u64,
    pub alloc_count: u64,
}

impl Usage {
    pub fn free_blocks(&self) -> u64 {
        self.block_count.saturating_sub(self.alloc_count)
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

/// Splits `/a/b/c` into `("/a/b", "c")`.
fn split_path(path: &str) -> Result<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some(("", name)) => Ok(("/", name)),
        Some((parent, name)) => Ok((parent, name)),
        None if !trimmed.is_empty() => Ok(("/", trimmed)),
        None => Err(FsError::InvalidName(path.to_owned())),
    }
}

/// A MOROS FS image mounted for reading and writing.
///
/// The image is owned for the whole mount and handed back by
/// [`MorosFs::unmount`].
#[derive(Debug)]
pub struct MorosFs<I: Image> {
    image: I,
    geometry: Geometry,
}

impl<I: Image> MorosFs<I> {
    /// Validates the superblock and derives the layout.
    pub fn open(image: I, block_size: u32) -> Result<Self> {
        let superblock_addr = geometry::superblock_addr(block_size);
        if image.len() < superblock_addr + u64::from(block_size) {
            return Err(FsError::InvalidImage(format!(
                "image of {} bytes has no superblock",
                image.len()
            )));
        }
        let mut buf = vec![0u8; block_size as usize];
        image.read_at(superblock_addr, &mut buf)?;
        let superblock = Superblock::parse(&buf)?;
        let geometry = Geometry::new(&superblock, block_size)?;
        if image.len() < geometry.end_addr() {
            return Err(FsError::InvalidImage(format!(
                "image of {} bytes is shorter than its {} blocks",
                image.len(),
                geometry.block_count
            )));
        }
        info!(
            block_size,
            block_count = geometry.block_count,
            alloc_count = superblock.alloc_count,
            data_addr = geometry.data_addr,
            "opened image"
        );
        Ok(Self { image, geometry })
    }

    /// Writes an empty filesystem spanning the whole image.
    pub fn format(mut image: I, block_size: u32) -> Result<Self> {
        if block_size < 512 || !block_size.is_power_of_two() {
            return Err(FsError::InvalidImage(format!("unsupported block size {block_size}")));
        }
        let block_count = u32::try_from(image.len() / u64::from(block_size))
            .map_err(|_| FsError::InvalidImage("image has too many blocks".to_owned()))?;
        let mut superblock = Superblock { block_size, block_count, alloc_count: 0 };
        let geometry = Geometry::new(&superblock, block_size)?;

        let zero = vec![0u8; block_size as usize];
        image.write_at(geometry.superblock_addr, &zero)?;
        let mut addr = geometry.bitmap_addr;
        while addr < geometry.data_addr {
            image.write_at(addr, &zero)?;
            addr += geometry.block_size;
        }
        bitmap::allocate(&mut image, &geometry, geometry.data_addr)?;
        image.write_at(geometry.data_addr, &zero)?;
        superblock.alloc_count = 1;
        image.write_at(geometry.superblock_addr, &superblock.encode())?;
        image.flush()?;

        info!(block_size, block_count, data_addr = geometry.data_addr, "formatted image");
        Ok(Self { image, geometry })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn image(&self) -> &I {
        &self.image
    }

    /// Resolves `path`, `None` when it does not exist.
    pub fn scan(&self, path: &str) -> Result<Option<Node>> {
        dir::scan(&self.image, &self.geometry, path)
    }

    fn resolve(&self, path: &str) -> Result<Node> {
        self.scan(path)?.ok_or_else(|| FsError::NotFound(path.to_owned()))
    }

    pub fn lookup(&self, path: &str) -> Result<Stat> {
        let node = self.resolve(path)?;
        let size = if node.record_addr.is_none() {
            // The root has no record to hold its size.
            let mut records = ReadDir::new(&self.image, &self.geometry, node.entry.addr);
            for record in &mut records {
                record?;
            }
            records.live_len()
        } else {
            u64::from(node.entry.size)
        };
        Ok(Stat { kind: node.entry.kind, size, mtime: node.entry.mtime })
    }

    pub fn list(&self, path: &str) -> Result<Vec<Node>> {
        let node = self.resolve(path)?;
        if !node.entry.is_dir() {
            return Err(FsError::NotDirectory(path.to_owned()));
        }
        ReadDir::new(&self.image, &self.geometry, node.entry.addr).collect()
    }

    pub fn read(&self, path: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        let node = self.resolve(path)?;
        if node.entry.is_dir() {
            return Err(FsError::IsDirectory(path.to_owned()));
        }
        chain::read_range(
            &self.image,
            &self.geometry,
            node.entry.addr,
            u64::from(node.entry.size),
            offset,
            length,
        )
    }

    /// Writes `data` at `offset`, growing the file as needed.
    ///
    /// The new size is recorded before the payload is written, so a failure
    /// part way leaves the size ahead of the content.
    pub fn write(&mut self, path: &str, offset: u64, data: &[u8]) -> Result<usize> {
        let node = self.resolve(path)?;
        if node.entry.is_dir() {
            return Err(FsError::IsDirectory(path.to_owned()));
        }
        if data.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(FsError::FileTooLarge)?;
        let size = u32::try_from(end.max(u64::from(node.entry.size)))
            .map_err(|_| FsError::FileTooLarge)?;
        if let Some(record_addr) = node.record_addr {
            dir::update_record(&mut self.image, record_addr, size, now())?;
        }
        chain::write_range(&mut self.image, &self.geometry, node.entry.addr, offset, data)?;
        debug!(path, offset, len = data.len(), size, "wrote file");
        Ok(data.len())
    }

    pub fn create(&mut self, parent_path: &str, name: &str, kind: Kind) -> Result<Node> {
        let parent = self.resolve(parent_path)?;
        dir::create(&mut self.image, &self.geometry, &parent, name, kind, now())
    }

    pub fn mkdir(&mut self, path: &str) -> Result<Node> {
        let (parent, name) = split_path(path)?;
        self.create(parent, name, Kind::Directory)
    }

    pub fn create_file(&mut self, path: &str) -> Result<Node> {
        let (parent, name) = split_path(path)?;
        self.create(parent, name, Kind::File)
    }

    /// Block counts from the superblock.
    pub fn usage(&self) -> Result<Usage> {
        let mut buf = vec![0u8; self.geometry.block_size as usize];
        self.image.read_at(self.geometry.superblock_addr, &mut buf)?;
        let superblock = Superblock::parse(&buf)?;
        Ok(Usage {
            block_size: self.geometry.block_size,
            block_count: self.geometry.block_count,
            alloc_count: u64::from(superblock.alloc_count),
        })
    }

    pub fn flush(&mut self) -> Result<()> {
        self.image.flush()
    }

    /// Flushes and releases the image.
    pub fn unmount(mut self) -> Result<I> {
        self.image.flush()?;
        info!("unmounted image");
        Ok(self.image)
    }
}
