//! FUSE driver for MOROS FS disk images.

pub mod bitmap;
pub mod chain;
pub mod dir;
pub mod entry;
pub mod error;
pub mod filesystem;
pub mod fs;
pub mod geometry;
pub mod image;

pub use dir::Node;
pub use entry::{Entry, Kind};
pub use error::{FsError, Result};
pub use filesystem::{MorosFuse, MountOptions};
pub use fs::{MorosFs, Stat, Usage};
pub use geometry::{Geometry, Superblock, DEFAULT_BLOCK_SIZE};
pub use image::{FileImage, Image, MemImage};
