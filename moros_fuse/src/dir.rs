//! Directory chains: record iteration, path resolution and entry creation.

use tracing::{debug, warn};

use crate::chain;
use crate::entry::{self, Decoded, Entry, Kind, HEADER_LEN, MAX_NAME_LEN};
use crate::error::{FsError, Result};
use crate::geometry::Geometry;
use crate::image::Image;

/// Records start after the next-block pointer.
const FIRST_RECORD: usize = 4;
/// Offset of `size` inside a record.
const SIZE_OFFSET: u64 = 5;
/// Offset of `mtime` inside a record.
const MTIME_OFFSET: u64 = 9;

/// An entry together with the address of the record it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub entry: Entry,
    /// `None` for the root directory, which has no record.
    pub record_addr: Option<u64>,
}

impl Node {
    pub fn root(data_addr: u64) -> Self {
        Self { entry: Entry::root(data_addr), record_addr: None }
    }
}

/// Iterator over the live records of a directory chain.
///
/// Tombstones (`addr == 0`) are skipped, and so are records of unknown kind
/// or whose name is not valid UTF-8. A chain longer than the data region
/// is reported as `InvalidImage`. Once exhausted, [`ReadDir::tail`] gives the position
/// where the next record can be appended.
pub struct ReadDir<'a, I: Image> {
    image: &'a I,
    geometry: &'a Geometry,
    block_addr: u64,
    block: Vec<u8>,
    loaded: bool,
    offset: usize,
    live_len: u64,
    /// Blocks that may still be followed before the chain counts as cyclic.
    blocks_left: u64,
    finished: bool,
}

impl<'a, I: Image> ReadDir<'a, I> {
    pub fn new(image: &'a I, geometry: &'a Geometry, start: u64) -> Self {
        Self {
            image,
            geometry,
            block_addr: start,
            block: vec![0u8; geometry.block_size as usize],
            loaded: false,
            offset: FIRST_RECORD,
            live_len: 0,
            blocks_left: geometry.bitmap_blocks() * 8 * geometry.block_size,
            finished: false,
        }
    }

    /// Last block of the chain and the offset of its first free record slot.
    pub fn tail(&self) -> (u64, usize) {
        (self.block_addr, self.offset)
    }

    /// Total encoded length of the live records yielded so far.
    pub fn live_len(&self) -> u64 {
        self.live_len
    }

    fn fail(&mut self, err: FsError) -> Option<Result<Node>> {
        self.finished = true;
        Some(Err(err))
    }
}

impl<I: Image> Iterator for ReadDir<'_, I> {
    type Item = Result<Node>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            if !self.loaded {
                if let Err(err) = self.image.read_at(self.block_addr, &mut self.block) {
                    return self.fail(err);
                }
                self.loaded = true;
            }
            let decoded = entry::decode(
                &self.block,
                self.offset,
                self.block_addr,
                self.geometry.block_size,
            );
            match decoded {
                Ok(Decoded::Record { entry, len }) => {
                    let record_addr = self.block_addr + self.offset as u64;
                    self.offset += len;
                    if entry.addr == 0 {
                        continue;
                    }
                    self.live_len += len as u64;
                    return Some(Ok(Node { entry, record_addr: Some(record_addr) }));
                }
                Ok(Decoded::Unknown { kind, len }) => {
                    warn!(addr = self.block_addr + self.offset as u64, kind, "skipping record of unknown kind");
                    self.offset += len;
                }
                Ok(Decoded::End) => match chain::next_block(self.image, self.geometry, self.block_addr) {
                    Ok(0) => self.finished = true,
                    Ok(_) if self.blocks_left == 0 => {
                        return self.fail(FsError::InvalidImage(format!(
                            "directory chain at {:#x} does not terminate",
                            self.block_addr
                        )));
                    }
                    Ok(next) => {
                        self.blocks_left -= 1;
                        self.block_addr = next;
                        self.offset = FIRST_RECORD;
                        self.loaded = false;
                    }
                    Err(err) => return self.fail(err),
                },
                Err(FsError::InvalidEncoding { addr }) => {
                    warn!(addr, "skipping record with malformed name");
                    self.offset += HEADER_LEN + usize::from(self.block[self.offset + HEADER_LEN - 1]);
                }
                Err(err) => return self.fail(err),
            }
        }
        None
    }
}

pub fn find(image: &impl Image, geometry: &Geometry, dir_addr: u64, name: &str) -> Result<Option<Node>> {
    for node in ReadDir::new(image, geometry, dir_addr) {
        let node = node?;
        if node.entry.name == name {
            return Ok(Some(node));
        }
    }
    Ok(None)
}

/// Resolves a slash separated path from the root directory.
///
/// Returns `None` when a component is missing or when the path walks
/// through a file.
pub fn scan(image: &impl Image, geometry: &Geometry, path: &str) -> Result<Option<Node>> {
    let mut node = Node::root(geometry.data_addr);
    for name in path.split('/').filter(|name| !name.is_empty()) {
        if !node.entry.is_dir() {
            return Ok(None);
        }
        match find(image, geometry, node.entry.addr, name)? {
            Some(child) => node = child,
            None => return Ok(None),
        }
    }
    Ok(Some(node))
}

/// Rewrites the size and mtime fields of the record at `record_addr`.
pub fn update_record(image: &mut impl Image, record_addr: u64, size: u32, mtime: u64) -> Result<()> {
    image.write_u32(record_addr + SIZE_OFFSET, size)?;
    image.write_at(record_addr + MTIME_OFFSET, &mtime.to_be_bytes())
}

pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
        return Err(FsError::InvalidName(name.to_owned()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(FsError::NameTooLong(name.len()));
    }
    Ok(())
}

/// Appends a record for `name` to the `parent` directory and allocates the
/// first block of its chain.
///
/// The parent's size is rewritten first, then the new block is allocated,
/// then the record is written. A full directory block is extended with a
/// new linked block.
pub fn create(
    image: &mut impl Image,
    geometry: &Geometry,
    parent: &Node,
    name: &str,
    kind: Kind,
    mtime: u64,
) -> Result<Node> {
    validate_name(name)?;
    if !parent.entry.is_dir() {
        return Err(FsError::NotDirectory(parent.entry.name.clone()));
    }

    let (tail, live_len) = {
        let mut records = ReadDir::new(&*image, geometry, parent.entry.addr);
        for node in &mut records {
            if node?.entry.name == name {
                return Err(FsError::Exists(name.to_owned()));
            }
        }
        (records.tail(), records.live_len())
    };

    let record_len = HEADER_LEN + name.len();
    let dir_size = u32::try_from(live_len + record_len as u64).map_err(|_| FsError::FileTooLarge)?;
    if let Some(record_addr) = parent.record_addr {
        update_record(image, record_addr, dir_size, mtime)?;
    }

    let addr = chain::alloc_block(image, geometry)?;
    let entry = Entry { kind, addr, size: 0, mtime, name: name.to_owned() };
    let bytes = entry::encode(&entry, geometry.block_size)?;

    let (mut block_addr, mut offset) = tail;
    if offset + record_len > geometry.block_size as usize {
        let next = chain::alloc_block(image, geometry)?;
        chain::set_next_block(image, geometry, block_addr, next)?;
        debug!(dir = parent.entry.addr, block = next, "extended directory");
        block_addr = next;
        offset = FIRST_RECORD;
    }
    let record_addr = block_addr + offset as u64;
    image.write_at(record_addr, &bytes)?;
    debug!(name, ?kind, addr, record_addr, "created entry");

    Ok(Node { entry, record_addr: Some(record_addr) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap;
    use crate::geometry::Superblock;
    use crate::image::MemImage;

    fn fixture() -> (MemImage, Geometry) {
        let superblock = Superblock { block_size: 512, block_count: 8195, alloc_count: 0 };
        let geometry = Geometry::new(&superblock, 512).unwrap();
        let mut image = MemImage::new(geometry.end_addr() as usize);
        image.write_at(geometry.superblock_addr, &superblock.encode()).unwrap();
        bitmap::allocate(&mut image, &geometry, geometry.data_addr).unwrap();
        (image, geometry)
    }

    fn names(image: &MemImage, geometry: &Geometry, dir: u64) -> Vec<String> {
        ReadDir::new(image, geometry, dir)
            .map(|node| node.unwrap().entry.name)
            .collect()
    }

    #[test]
    fn scan_resolves_nested_paths() {
        let (mut image, geo) = fixture();
        let root = Node::root(geo.data_addr);
        let etc = create(&mut image, &geo, &root, "etc", Kind::Directory, 1).unwrap();
        let hosts = create(&mut image, &geo, &etc, "hosts", Kind::File, 2).unwrap();

        assert_eq!(scan(&image, &geo, "/").unwrap(), Some(root.clone()));
        assert_eq!(scan(&image, &geo, "").unwrap(), Some(root));
        let resolved = scan(&image, &geo, "/etc").unwrap().unwrap();
        assert_eq!(resolved.record_addr, etc.record_addr);
        assert_eq!(resolved.entry.addr, etc.entry.addr);
        let found = scan(&image, &geo, "/etc/hosts").unwrap().unwrap();
        assert_eq!(found, hosts);
        assert_eq!(found.entry.kind, Kind::File);
        assert_eq!(scan(&image, &geo, "/etc/passwd").unwrap(), None);
        assert_eq!(scan(&image, &geo, "/ETC").unwrap(), None);
        assert_eq!(scan(&image, &geo, "/etc/hosts/x").unwrap(), None);
    }

    #[test]
    fn create_updates_parent_size() {
        let (mut image, geo) = fixture();
        let root = Node::root(geo.data_addr);
        create(&mut image, &geo, &root, "dir", Kind::Directory, 1).unwrap();
        let dir = scan(&image, &geo, "/dir").unwrap().unwrap();
        assert_eq!(dir.entry.size, 0);

        create(&mut image, &geo, &dir, "a", Kind::File, 5).unwrap();
        create(&mut image, &geo, &dir, "bcd", Kind::File, 6).unwrap();
        let dir = scan(&image, &geo, "/dir").unwrap().unwrap();
        assert_eq!(dir.entry.size as usize, HEADER_LEN + 1 + HEADER_LEN + 3);
        assert_eq!(dir.entry.mtime, 6);
    }

    #[test]
    fn create_rejects_duplicates_and_bad_names() {
        let (mut image, geo) = fixture();
        let root = Node::root(geo.data_addr);
        let file = create(&mut image, &geo, &root, "f", Kind::File, 0).unwrap();
        assert!(matches!(
            create(&mut image, &geo, &root, "f", Kind::Directory, 0),
            Err(FsError::Exists(_))
        ));
        for bad in ["", ".", "..", "a/b"] {
            assert!(matches!(
                create(&mut image, &geo, &root, bad, Kind::File, 0),
                Err(FsError::InvalidName(_))
            ));
        }
        assert!(matches!(
            create(&mut image, &geo, &root, &"n".repeat(300), Kind::File, 0),
            Err(FsError::NameTooLong(300))
        ));
        assert!(matches!(
            create(&mut image, &geo, &file, "g", Kind::File, 0),
            Err(FsError::NotDirectory(_))
        ));
    }

    #[test]
    fn full_directory_block_grows_the_chain() {
        let (mut image, geo) = fixture();
        let root = Node::root(geo.data_addr);
        // 28-byte records: 18 fit in the 508-byte payload
        let expected: Vec<String> = (0..40).map(|i| format!("file{i:06}")).collect();
        for name in &expected {
            create(&mut image, &geo, &root, name, Kind::File, 0).unwrap();
        }
        assert_ne!(chain::next_block(&image, &geo, geo.data_addr).unwrap(), 0);
        assert_eq!(names(&image, &geo, geo.data_addr), expected);
        let last = scan(&image, &geo, "/file000039").unwrap().unwrap();
        assert!(bitmap::is_allocated(&image, &geo, last.entry.addr).unwrap());
    }

    #[test]
    fn iteration_skips_tombstones_and_bad_names() {
        let (mut image, geo) = fixture();
        let root = Node::root(geo.data_addr);
        let a = create(&mut image, &geo, &root, "a", Kind::File, 0).unwrap();
        let b = create(&mut image, &geo, &root, "b", Kind::File, 0).unwrap();
        create(&mut image, &geo, &root, "c", Kind::File, 0).unwrap();

        image.write_u32(a.record_addr.unwrap() + 1, 0).unwrap();
        image.write_at(b.record_addr.unwrap() + HEADER_LEN as u64, &[0xff]).unwrap();
        assert_eq!(names(&image, &geo, geo.data_addr), vec!["c".to_owned()]);

        let mut records = ReadDir::new(&image, &geo, geo.data_addr);
        assert_eq!(records.by_ref().count(), 1);
        assert_eq!(records.tail(), (geo.data_addr, FIRST_RECORD + 3 * (HEADER_LEN + 1)));
    }

    #[test]
    fn unknown_kind_is_skipped_and_appended_after() {
        let (mut image, geo) = fixture();
        let root = Node::root(geo.data_addr);
        let odd = create(&mut image, &geo, &root, "odd", Kind::File, 0).unwrap();
        image.write_at(odd.record_addr.unwrap(), &[9]).unwrap();
        create(&mut image, &geo, &root, "next", Kind::File, 0).unwrap();

        assert_eq!(names(&image, &geo, geo.data_addr), vec!["next".to_owned()]);
        let next = scan(&image, &geo, "/next").unwrap().unwrap();
        assert_eq!(next.record_addr, Some(geo.data_addr + (FIRST_RECORD + HEADER_LEN + 3) as u64));
    }

    #[test]
    fn cyclic_chain_is_reported() {
        let (mut image, geo) = fixture();
        let root = Node::root(geo.data_addr);
        create(&mut image, &geo, &root, "a", Kind::File, 0).unwrap();
        chain::set_next_block(&mut image, &geo, geo.data_addr, geo.data_addr).unwrap();

        let listed: Result<Vec<Node>> = ReadDir::new(&image, &geo, geo.data_addr).collect();
        assert!(matches!(listed, Err(FsError::InvalidImage(_))));
        assert!(matches!(scan(&image, &geo, "/missing"), Err(FsError::InvalidImage(_))));
        assert!(matches!(
            create(&mut image, &geo, &root, "b", Kind::File, 0),
            Err(FsError::InvalidImage(_))
        ));
    }
}
