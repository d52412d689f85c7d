//! Directory record codec.
//!
//! ```text
//! kind:1 | addr:4 | size:4 | mtime:8 | name_len:1 | name:name_len
//! ```
//!
//! Integers are big-endian and `addr` is stored as a block number. A record
//! with `name_len == 0` marks the unused tail of a directory block.

use crate::error::{FsError, Result};

pub const HEADER_LEN: usize = 1 + 4 + 4 + 8 + 1;
pub const MAX_NAME_LEN: usize = u8::MAX as usize;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Directory = 0,
    File = 1,
}

impl TryFrom<u8> for Kind {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            0 => Ok(Self::Directory),
            1 => Ok(Self::File),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub kind: Kind,
    /// Byte address of the first block of the entry's chain, 0 when absent.
    pub addr: u64,
    pub size: u32,
    /// Seconds since the Unix epoch.
    pub mtime: u64,
    pub name: String,
}

impl Entry {
    /// The root directory has no stored record of its own.
    pub fn root(data_addr: u64) -> Self {
        Self {
            kind: Kind::Directory,
            addr: data_addr,
            size: 0,
            mtime: 0,
            name: String::new(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.name.len()
    }

    pub fn is_dir(&self) -> bool {
        self.kind == Kind::Directory
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Record { entry: Entry, len: usize },
    /// A complete record with an unknown kind byte.
    Unknown { kind: u8, len: usize },
    /// Sentinel, or no room left in the block for another record.
    End,
}

/// Decodes the record at `offset` of a directory block.
///
/// `block_addr` is the byte address of `block`, used to report where a
/// corrupt record sits.
pub fn decode(block: &[u8], offset: usize, block_addr: u64, block_size: u64) -> Result<Decoded> {
    let Some(header) = block.get(offset..offset + HEADER_LEN) else {
        return Ok(Decoded::End);
    };
    let name_len = usize::from(header[17]);
    if name_len == 0 {
        return Ok(Decoded::End);
    }
    let Some(name) = block.get(offset + HEADER_LEN..offset + HEADER_LEN + name_len) else {
        return Ok(Decoded::End);
    };
    let kind = match Kind::try_from(header[0]) {
        Ok(kind) => kind,
        Err(kind) => return Ok(Decoded::Unknown { kind, len: HEADER_LEN + name_len }),
    };
    let block = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    let size = u32::from_be_bytes([header[5], header[6], header[7], header[8]]);
    let mut mtime = [0u8; 8];
    mtime.copy_from_slice(&header[9..17]);
    let name = std::str::from_utf8(name).map_err(|_| FsError::InvalidEncoding {
        addr: block_addr + offset as u64,
    })?;
    Ok(Decoded::Record {
        entry: Entry {
            kind,
            addr: u64::from(block) * block_size,
            size,
            mtime: u64::from_be_bytes(mtime),
            name: name.to_owned(),
        },
        len: HEADER_LEN + name_len,
    })
}

pub fn encode(entry: &Entry, block_size: u64) -> Result<Vec<u8>> {
    let name = entry.name.as_bytes();
    if name.is_empty() {
        return Err(FsError::InvalidName(entry.name.clone()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(FsError::NameTooLong(name.len()));
    }
    if entry.addr % block_size != 0 {
        return Err(FsError::InvalidAddress { addr: entry.addr });
    }
    let block = u32::try_from(entry.addr / block_size)
        .map_err(|_| FsError::InvalidAddress { addr: entry.addr })?;

    let mut buf = Vec::with_capacity(entry.encoded_len());
    buf.push(entry.kind as u8);
    buf.extend_from_slice(&block.to_be_bytes());
    buf.extend_from_slice(&entry.size.to_be_bytes());
    buf.extend_from_slice(&entry.mtime.to_be_bytes());
    buf.push(name.len() as u8);
    buf.extend_from_slice(name);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn sample() -> Entry {
        Entry {
            kind: Kind::File,
            addr: 4100 * 512,
            size: 10,
            mtime: 1_700_000_000,
            name: "a.txt".to_owned(),
        }
    }

    #[test]
    fn encodes_reference_layout() {
        let bytes = encode(&sample(), 512).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 5);
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[1..5], &4100u32.to_be_bytes());
        assert_eq!(&bytes[5..9], &10u32.to_be_bytes());
        assert_eq!(&bytes[9..17], &1_700_000_000u64.to_be_bytes());
        assert_eq!(bytes[17], 5);
        assert_eq!(&bytes[18..], b"a.txt");
    }

    #[test]
    fn sentinel_and_short_tail_end_the_block() {
        let mut block = vec![0u8; 512];
        assert_eq!(decode(&block, 4, 0, 512).unwrap(), Decoded::End);
        assert_eq!(decode(&block, 500, 0, 512).unwrap(), Decoded::End);

        // name runs past the block boundary
        let bytes = encode(&sample(), 512).unwrap();
        block[490..508].copy_from_slice(&bytes[..HEADER_LEN]);
        assert_eq!(decode(&block, 490, 0, 512).unwrap(), Decoded::End);
    }

    #[test]
    fn unknown_kind_reports_record_length() {
        let mut bytes = encode(&sample(), 512).unwrap();
        bytes[0] = 7;
        assert_eq!(
            decode(&bytes, 0, 0, 512).unwrap(),
            Decoded::Unknown { kind: 7, len: HEADER_LEN + 5 }
        );
    }

    #[test]
    fn longest_names_round_trip() {
        let mut ascii = sample();
        ascii.name = "n".repeat(MAX_NAME_LEN);
        // 85 three-byte characters end exactly at the limit
        let mut wide = sample();
        wide.name = "\u{20ac}".repeat(85);
        assert_eq!(wide.name.len(), MAX_NAME_LEN);

        for entry in [ascii, wide] {
            let bytes = encode(&entry, 512).unwrap();
            assert_eq!(bytes.len(), HEADER_LEN + MAX_NAME_LEN);
            assert_eq!(bytes[17], u8::MAX);
            let mut block = vec![0u8; 512];
            block[4..4 + bytes.len()].copy_from_slice(&bytes);
            assert_eq!(
                decode(&block, 4, 0, 512).unwrap(),
                Decoded::Record { len: entry.encoded_len(), entry }
            );
        }
    }

    #[test]
    fn malformed_utf8_reports_record_address() {
        let mut block = vec![0u8; 512];
        let mut bytes = encode(&sample(), 512).unwrap();
        bytes[18] = 0xff;
        block[4..4 + bytes.len()].copy_from_slice(&bytes);
        let err = decode(&block, 4, 0x1000, 512).unwrap_err();
        assert!(matches!(err, FsError::InvalidEncoding { addr: 0x1004 }));
    }

    #[test]
    fn rejects_unencodable_entries() {
        let mut entry = sample();
        entry.name = "x".repeat(256);
        assert!(matches!(encode(&entry, 512), Err(FsError::NameTooLong(256))));
        entry.name.clear();
        assert!(matches!(encode(&entry, 512), Err(FsError::InvalidName(_))));
        let mut entry = sample();
        entry.addr += 1;
        assert!(matches!(encode(&entry, 512), Err(FsError::InvalidAddress { .. })));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn decode_inverts_encode(
            is_dir in any::<bool>(),
            block in any::<u32>(),
            size in any::<u32>(),
            mtime in any::<u64>(),
            name in "\\PC{1,60}",
        ) {
            prop_assume!(name.len() <= MAX_NAME_LEN);
            let entry = Entry {
                kind: if is_dir { Kind::Directory } else { Kind::File },
                addr: u64::from(block) * 512,
                size,
                mtime,
                name,
            };
            let bytes = encode(&entry, 512).unwrap();
            let decoded = decode(&bytes, 0, 0, 512).unwrap();
            prop_assert_eq!(decoded, Decoded::Record { len: entry.encoded_len(), entry });
        }
    }
}
