//! Error type shared by the engine and the FUSE adapter.
//!
//! Every variant maps to exactly one errno through [`FsError::to_errno`].
//! The match is exhaustive so a new variant cannot be added without
//! choosing its errno.

use std::os::raw::c_int;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    /// I/O failure on the underlying image, propagated unmodified.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bad signature, version or block size. Fatal at mount time.
    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A directory record whose name is not valid UTF-8.
    #[error("invalid name encoding in record at {addr:#x}")]
    InvalidEncoding { addr: u64 },

    /// The bitmap has no clear bit left.
    #[error("no space left on image")]
    OutOfSpace,

    /// A block address outside the data region or not block aligned.
    #[error("invalid block address {addr:#x}")]
    InvalidAddress { addr: u64 },

    #[error("not a directory: {0}")]
    NotDirectory(String),

    #[error("is a directory: {0}")]
    IsDirectory(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("invalid name: {0:?}")]
    InvalidName(String),

    #[error("name too long: {0} bytes")]
    NameTooLong(usize),

    #[error("file too large")]
    FileTooLarge,

    #[error("read-only image")]
    ReadOnly,

    #[error("negative offset {0}")]
    InvalidOffset(i64),

    /// An operation the filesystem does not implement, such as truncation.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

impl FsError {
    pub fn to_errno(&self) -> c_int {
        match self {
            Self::Io(_) => libc::EIO,
            Self::InvalidImage(_) => libc::EINVAL,
            Self::NotFound(_) => libc::ENOENT,
            Self::InvalidEncoding { .. } => libc::EIO,
            Self::OutOfSpace => libc::ENOSPC,
            Self::InvalidAddress { .. } => libc::EIO,
            Self::NotDirectory(_) => libc::ENOTDIR,
            Self::IsDirectory(_) => libc::EISDIR,
            Self::Exists(_) => libc::EEXIST,
            Self::InvalidName(_) => libc::EINVAL,
            Self::NameTooLong(_) => libc::ENAMETOOLONG,
            Self::FileTooLarge => libc::EFBIG,
            Self::ReadOnly => libc::EROFS,
            Self::InvalidOffset(_) => libc::EINVAL,
            Self::Unsupported(_) => libc::ENOSYS,
        }
    }
}

pub type Result<T> = std::result::Result<T, FsError>;
