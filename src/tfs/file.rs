//! The file layer: whole-file reads and writes, deletion and the data-chain
//! walker.
//!
//! File contents live in a doubly-linked chain of data blocks. Each block
//! starts with a `prev`/`next` header followed by up to [`DATA_LEN`] payload
//! bytes; a file of `size` bytes occupies exactly `ceil(size / DATA_LEN)`
//! blocks, and an empty file occupies none at all (its directory item carries
//! block number zero).

use crate::dev::{Block, BlockDevice, BLOCK_SIZE};
use crate::dir::{check_name, name_key, DirItem, ItemType};
use crate::{Error, Result, TinyFs};

/// The size of the data block header.
pub(crate) const DATA_HEADER_LEN: usize = 8;
/// The number of payload bytes per data block.
pub const DATA_LEN: usize = BLOCK_SIZE - DATA_HEADER_LEN;

/// Returns the `(prev, next)` links of the data block in `buf`.
pub(crate) fn data_links(buf: &Block) -> (u32, u32) {
    (
        u32::from_le_bytes(buf[0..4].try_into().unwrap()),
        u32::from_le_bytes(buf[4..8].try_into().unwrap()),
    )
}

/// Sets the `(prev, next)` links of the data block in `buf`.
pub(crate) fn set_data_links(buf: &mut Block, prev: u32, next: u32) {
    buf[0..4].copy_from_slice(&prev.to_le_bytes());
    buf[4..8].copy_from_slice(&next.to_le_bytes());
}

impl<D: BlockDevice> TinyFs<D> {
    /// Writes a file named `name` holding `data` into the current directory.
    ///
    /// When the name is already taken, the call fails with
    /// [`Error::FileExist`] unless `overwrite` is set and the existing item is
    /// a file, in which case the old contents are released first.
    pub fn write_file(&mut self, name: &str, data: &[u8], overwrite: bool) -> Result<()> {
        self.with_drive(|fs| fs.do_write_file(name, data, overwrite))
    }

    fn do_write_file(&mut self, name: &str, data: &[u8], overwrite: bool) -> Result<()> {
        check_name(name)?;
        let size = u32::try_from(data.len()).map_err(|_| Error::DiskFull)?;
        let mut slot = self.reserve_item(name)?;
        let old = *slot.item();
        if old.item_type != ItemType::Free {
            if !overwrite || old.item_type != ItemType::File {
                return Err(Error::FileExist);
            }
            #[cfg(feature = "extended")]
            self.check_busy(slot.blk, slot.index)?;
            self.free_chain(old.blk)?;
        }
        let first = if data.is_empty() {
            0
        } else {
            self.bitmap.alloc(&mut self.dev)?
        };
        slot.dir.items[slot.index] = DirItem {
            blk: first,
            size,
            item_type: ItemType::File,
            name: name_key(name),
        };
        self.write_dir_blk(slot.blk, &slot.dir)?;

        let mut buf = [0; BLOCK_SIZE];
        let mut pos = first;
        let mut prev = 0;
        let mut rest = data;
        while !rest.is_empty() {
            let chunk = rest.len().min(DATA_LEN);
            let next = if rest.len() > chunk {
                self.bitmap.alloc(&mut self.dev)?
            } else {
                0
            };
            buf.fill(0);
            set_data_links(&mut buf, prev, next);
            buf[DATA_HEADER_LEN..DATA_HEADER_LEN + chunk].copy_from_slice(&rest[..chunk]);
            self.dev.write_block(pos, &buf)?;
            rest = &rest[chunk..];
            prev = pos;
            pos = next;
        }
        Ok(())
    }

    /// Reads the file `name` from the current directory into `buf`, returning
    /// the number of bytes read: the file size, clamped to the buffer length.
    pub fn read_file(&mut self, name: &str, buf: &mut [u8]) -> Result<usize> {
        self.with_drive(|fs| fs.do_read_file(name, buf))
    }

    fn do_read_file(&mut self, name: &str, out: &mut [u8]) -> Result<usize> {
        let Some(slot) = self.find_item(name)? else {
            return Err(Error::NotExist);
        };
        let item = slot.item();
        if item.item_type != ItemType::File {
            return Err(Error::NotExist);
        }
        let len = (item.size as usize).min(out.len());
        let mut pos = item.blk;
        let mut off = 0;
        let mut buf = [0; BLOCK_SIZE];
        while off < len {
            if pos == 0 {
                // the chain is shorter than the directory item announced
                return Err(Error::UnexpectedEof);
            }
            self.dev.read_block(pos, &mut buf)?;
            let chunk = (len - off).min(DATA_LEN);
            out[off..off + chunk]
                .copy_from_slice(&buf[DATA_HEADER_LEN..DATA_HEADER_LEN + chunk]);
            off += chunk;
            pos = data_links(&buf).1;
        }
        Ok(len)
    }

    /// Deletes the file or directory `name` from the current directory.
    ///
    /// Directories must be empty, otherwise the call fails with
    /// [`Error::NotEmpty`].
    pub fn delete(&mut self, name: &str) -> Result<()> {
        self.with_drive(|fs| fs.do_delete(name, None))
    }

    pub(crate) fn do_delete(&mut self, name: &str, type_filter: Option<ItemType>) -> Result<()> {
        let Some(mut slot) = self.find_item(name)? else {
            return Err(Error::NotExist);
        };
        let item = *slot.item();
        if type_filter.is_some_and(|t| item.item_type != t) {
            return Err(Error::NotExist);
        }
        match item.item_type {
            ItemType::File => {
                #[cfg(feature = "extended")]
                self.check_busy(slot.blk, slot.index)?;
                slot.dir.items[slot.index] = DirItem::FREE;
                self.write_dir_cleanup(slot.blk, &slot.dir)?;
                self.free_chain(item.blk)
            }
            ItemType::Dir => {
                let sub = self.read_dir_blk(item.blk)?;
                if sub.next != 0 || !sub.is_empty() {
                    return Err(Error::NotEmpty);
                }
                slot.dir.items[slot.index] = DirItem::FREE;
                self.write_dir_cleanup(slot.blk, &slot.dir)?;
                self.bitmap.free(&mut self.dev, item.blk)
            }
            ItemType::Free => Err(Error::NotExist),
        }
    }

    /// Releases every block of the data chain starting at `pos`.
    pub(crate) fn free_chain(&mut self, mut pos: u32) -> Result<()> {
        let mut buf = [0; BLOCK_SIZE];
        while pos != 0 {
            self.dev.read_block(pos, &mut buf)?;
            let (_, next) = data_links(&buf);
            self.bitmap.free(&mut self.dev, pos)?;
            pos = next;
        }
        Ok(())
    }
}
