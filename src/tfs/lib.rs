//! TFS is a minimal hierarchical filesystem for small block devices such as
//! SD/MMC cards or raw image files.
//!
//! The device is an array of 512 byte blocks, addressed by a 32 bit block
//! number:
//! - Block `0` is the first allocation bitmap. Further bitmap blocks sit at
//!   every multiple of `4096`, each covering the 4096 blocks starting at its
//!   own address.
//! - Block `1` is the first block of the root directory.
//! - Every other block is free for allocation.
//!
//! Directories are doubly-linked chains of blocks, each holding a fixed number
//! of [`DirItem`] slots. File contents are doubly-linked chains of data blocks
//! carrying up to [`DATA_LEN`] payload bytes each. All on-disk integers are
//! little-endian, so an image written on one host is readable on any other.
//!
//! The entry point is [`TinyFs`], which owns the [`BlockDevice`] and all
//! filesystem state. The `extended` feature adds a table of file handles with
//! positioned reads and writes (see the `fd` module).

pub mod bitmap;
pub mod dev;
pub mod dir;
#[cfg(feature = "extended")]
pub mod fd;
pub mod file;
pub mod format;

use bitmap::Bitmap;
use dir::DirBlock;
use std::io;
use thiserror::Error;

pub use dev::{Block, BlockDevice, DriveInfo, DriveType, FileDrive, MemDrive, BLOCK_SIZE};
pub use dir::{DirItem, ItemType, DIR_BLK_ITEMS, NAME_LEN};
pub use file::DATA_LEN;
pub use format::{FormatObserver, FormatState};

/// The block number of the first allocation bitmap.
pub const FIRST_BITMAP_BLK: u32 = 0;
/// The block number of the root directory's first block.
///
/// It doubles as the "no parent" sentinel in directory headers: only the root
/// itself has `parent == 0`.
pub const ROOT_DIR_BLK: u32 = 1;

/// A filesystem error.
///
/// [`Error::code`] exposes the stable numeric value of each error, matching
/// the on-wire taxonomy used by foreign implementations.
#[derive(Debug, Error)]
pub enum Error {
    /// No usable device found.
    #[error("no device found")]
    NoDevice,
    /// The underlying device failed.
    #[error("I/O error")]
    Io(#[from] io::Error),
    /// No free block is left on the device.
    #[error("disk full")]
    DiskFull,
    /// The target name already exists.
    #[error("file already exists")]
    FileExist,
    /// The target name does not exist.
    #[error("file does not exist")]
    NotExist,
    /// The directory to be removed still has entries.
    #[error("directory not empty")]
    NotEmpty,
    /// An empty name was given.
    #[error("no filename given")]
    NoName,
    /// A reserved name was given.
    #[error("invalid filename")]
    NameInvalid,
    /// A block chain ended before the announced length was reached.
    #[error("unexpected end of file")]
    UnexpectedEof,
    /// Every slot of the file handle table is in use.
    #[cfg(feature = "extended")]
    #[error("no free file handle available")]
    NoFreeFd,
    /// The given handle is closed or out of range.
    #[cfg(feature = "extended")]
    #[error("invalid file handle")]
    InvalFd,
    /// The file is open through a handle and cannot be reshaped.
    #[cfg(feature = "extended")]
    #[error("file is busy")]
    FileBusy,
}

impl Error {
    /// Returns the stable numeric code of the error.
    pub fn code(&self) -> u8 {
        match self {
            Self::NoDevice => 1,
            Self::Io(_) => 2,
            Self::DiskFull => 3,
            Self::FileExist => 4,
            Self::NotExist => 5,
            Self::NotEmpty => 6,
            Self::NoName => 7,
            Self::NameInvalid => 8,
            Self::UnexpectedEof => 9,
            #[cfg(feature = "extended")]
            Self::NoFreeFd => 100,
            #[cfg(feature = "extended")]
            Self::InvalFd => 101,
            #[cfg(feature = "extended")]
            Self::FileBusy => 102,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A mounted TFS filesystem on top of a block device.
///
/// All state lives here: the allocator's cached bitmap block, the current
/// directory cursor and, with the `extended` feature, the file handle table.
/// Operations are strictly sequential; the device is selected for the duration
/// of each public call and deselected again on every exit path.
pub struct TinyFs<D: BlockDevice> {
    dev: D,
    bitmap: Bitmap,
    /// First block of the current working directory's chain.
    cur_dir: u32,
    #[cfg(feature = "extended")]
    fds: [fd::Fd; fd::MAX_FDS],
}

impl<D: BlockDevice> TinyFs<D> {
    /// Mounts the filesystem on `dev`.
    ///
    /// The device must at least hold the first bitmap block and the root
    /// directory. The first bitmap block is loaded as the allocator's starting
    /// point; nothing else is validated, so mounting an unformatted device
    /// succeeds but yields undefined directory contents until [`Self::format`]
    /// is run.
    pub fn mount(mut dev: D) -> Result<Self> {
        let blk_count = dev.info().blk_count;
        if blk_count <= ROOT_DIR_BLK {
            return Err(Error::NoDevice);
        }
        let mut bitmap = Bitmap::new(blk_count);
        dev.select();
        let res = bitmap.load(&mut dev, FIRST_BITMAP_BLK);
        dev.deselect();
        res?;
        Ok(Self {
            dev,
            bitmap,
            cur_dir: ROOT_DIR_BLK,
            #[cfg(feature = "extended")]
            fds: [fd::Fd::default(); fd::MAX_FDS],
        })
    }

    /// Returns the metadata of the underlying drive.
    pub fn drive_info(&self) -> &DriveInfo {
        self.dev.info()
    }

    /// Unmounts the filesystem, returning the underlying device.
    pub fn into_device(self) -> D {
        self.dev
    }

    /// Returns the number of blocks currently allocated on the device,
    /// including the bitmap blocks themselves.
    pub fn used_count(&mut self) -> Result<u32> {
        self.with_drive(|fs| fs.bitmap.used_count(&mut fs.dev))
    }

    /// Runs `op` with the drive selected, deselecting it again afterwards
    /// whether `op` succeeded or not.
    fn with_drive<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.dev.select();
        let res = op(self);
        self.dev.deselect();
        res
    }

    fn read_dir_blk(&mut self, blk: u32) -> Result<DirBlock> {
        let mut buf = [0; BLOCK_SIZE];
        self.dev.read_block(blk, &mut buf)?;
        DirBlock::decode(&buf)
    }

    fn write_dir_blk(&mut self, blk: u32, dir: &DirBlock) -> Result<()> {
        let mut buf = [0; BLOCK_SIZE];
        dir.encode(&mut buf);
        self.dev.write_block(blk, &buf)?;
        Ok(())
    }
}
