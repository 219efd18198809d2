//! The block device contract consumed by the filesystem, along with the host
//! drive implementations: a file/block-device backed emulator and an in-memory
//! drive.

use libc::ioctl;
use std::ffi::c_long;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Error;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

/// The size of a device block in bytes.
pub const BLOCK_SIZE: usize = 512;

/// One device block.
pub type Block = [u8; BLOCK_SIZE];

/// ioctl macro: Command.
macro_rules! ioc {
    ($a:expr, $b:expr, $c:expr, $d:expr) => {
        (($a) << 30) | (($b) << 8) | ($c) | (($d) << 16)
    };
}

/// ioctl macro: Read command.
macro_rules! ior {
    ($a:expr, $b:expr, $c:ty) => {
        ioc!(2, $a, $b, std::mem::size_of::<$c>() as c_long)
    };
}

/// ioctl command: Get size of disk in bytes.
const BLKGETSIZE64: c_long = ior!(0x12, 114, u64);

/// The kind of drive behind a [`BlockDevice`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum DriveType {
    /// Host-side emulation on a file or block device.
    Emu = 0,
    /// MMC card.
    Mmc = 1,
    /// SD card, version 1.
    SdV1 = 2,
    /// SD card, version 2.
    SdV2 = 3,
    /// High capacity SD card.
    Sdhc = 4,
}

/// Metadata of a drive.
#[derive(Clone, Debug)]
pub struct DriveInfo {
    /// Human-readable model name, at most 32 bytes.
    pub model: String,
    /// Serial number, at most 20 bytes.
    pub serno: String,
    /// The kind of drive.
    pub drive_type: DriveType,
    /// The total number of blocks on the drive.
    pub blk_count: u32,
}

/// A device exposing fixed-size block I/O.
///
/// Every filesystem operation is bracketed by a [`select`](Self::select) /
/// [`deselect`](Self::deselect) pair. On SPI-attached cards these assert and
/// release the chip-select line; host-side drives can ignore them.
pub trait BlockDevice {
    /// Acquires the device for a sequence of block transfers.
    fn select(&mut self) {}

    /// Releases the device again.
    fn deselect(&mut self) {}

    /// Reads the block `blkno` into `buf`.
    fn read_block(&mut self, blkno: u32, buf: &mut Block) -> io::Result<()>;

    /// Writes `buf` to the block `blkno`.
    fn write_block(&mut self, blkno: u32, buf: &Block) -> io::Result<()>;

    /// Returns the metadata of the drive.
    fn info(&self) -> &DriveInfo;
}

/// Returns the size of the given open device in bytes.
///
/// For a block or character device the size is queried from the kernel, for a
/// regular file it is the file's length.
fn get_disk_size(dev: &File) -> io::Result<u64> {
    let metadata = dev.metadata()?;
    let file_type = metadata.file_type();
    if file_type.is_block_device() || file_type.is_char_device() {
        let mut size = 0u64;
        let ret = unsafe { ioctl(dev.as_raw_fd(), BLKGETSIZE64 as _, &mut size) };
        if ret < 0 {
            return Err(Error::last_os_error());
        }
        Ok(size)
    } else if file_type.is_file() {
        Ok(metadata.len())
    } else {
        Err(Error::from(ErrorKind::InvalidInput))
    }
}

/// A drive backed by a regular file or a host block device.
///
/// This is the host-side stand-in for a real card: a raw image file reports
/// itself as `mmc-emu`, an actual block device as `sd-card`.
pub struct FileDrive {
    file: File,
    info: DriveInfo,
}

impl FileDrive {
    /// Opens the device or image file at `path` for reading and writing.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let model = if file.metadata()?.file_type().is_file() {
            "mmc-emu"
        } else {
            "sd-card"
        };
        let blk_count = (get_disk_size(&file)? / BLOCK_SIZE as u64) as u32;
        Ok(Self {
            file,
            info: DriveInfo {
                model: model.to_owned(),
                serno: "N/A".to_owned(),
                drive_type: DriveType::Emu,
                blk_count,
            },
        })
    }
}

impl BlockDevice for FileDrive {
    fn read_block(&mut self, blkno: u32, buf: &mut Block) -> io::Result<()> {
        self.file
            .seek(SeekFrom::Start(blkno as u64 * BLOCK_SIZE as u64))?;
        self.file.read_exact(buf)
    }

    fn write_block(&mut self, blkno: u32, buf: &Block) -> io::Result<()> {
        self.file
            .seek(SeekFrom::Start(blkno as u64 * BLOCK_SIZE as u64))?;
        self.file.write_all(buf)
    }

    fn info(&self) -> &DriveInfo {
        &self.info
    }
}

/// A drive living entirely in memory, mainly useful for tests and scratch
/// images.
pub struct MemDrive {
    blocks: Vec<u8>,
    info: DriveInfo,
}

impl MemDrive {
    /// Creates a zero-filled drive with `blk_count` blocks.
    pub fn new(blk_count: u32) -> Self {
        Self {
            blocks: vec![0; blk_count as usize * BLOCK_SIZE],
            info: DriveInfo {
                model: "mem-emu".to_owned(),
                serno: "N/A".to_owned(),
                drive_type: DriveType::Emu,
                blk_count,
            },
        }
    }

    fn range(&self, blkno: u32) -> io::Result<std::ops::Range<usize>> {
        if blkno >= self.info.blk_count {
            return Err(Error::from(ErrorKind::InvalidInput));
        }
        let start = blkno as usize * BLOCK_SIZE;
        Ok(start..start + BLOCK_SIZE)
    }
}

impl BlockDevice for MemDrive {
    fn read_block(&mut self, blkno: u32, buf: &mut Block) -> io::Result<()> {
        let range = self.range(blkno)?;
        buf.copy_from_slice(&self.blocks[range]);
        Ok(())
    }

    fn write_block(&mut self, blkno: u32, buf: &Block) -> io::Result<()> {
        let range = self.range(blkno)?;
        self.blocks[range].copy_from_slice(buf);
        Ok(())
    }

    fn info(&self) -> &DriveInfo {
        &self.info
    }
}
