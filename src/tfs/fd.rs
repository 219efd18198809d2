//! The file handle layer: positioned reads and writes through a fixed table
//! of open handles.
//!
//! Each handle keeps a cursor, the block number of a data block together with
//! the file offset that block starts at. Seeking walks the chain forward or
//! backward from the cursor instead of restarting at the file's first block,
//! so sequential and locally clustered accesses touch as few blocks as
//! possible. Opening the same file twice yields the same handle with a use
//! count, which also lets the basic layer refuse to delete or overwrite a
//! file that is still open.

use crate::dev::{BlockDevice, BLOCK_SIZE};
use crate::dir::{check_name, name_key, DirItem, ItemType};
use crate::file::{data_links, set_data_links, DATA_HEADER_LEN, DATA_LEN};
use crate::{Error, Result, TinyFs};

/// The number of slots in the file handle table.
pub const MAX_FDS: usize = 32;

/// One slot of the file handle table. A slot with a use count of zero is
/// free.
#[derive(Clone, Copy, Default)]
pub(crate) struct Fd {
    /// The number of times the file is currently open.
    usage: u8,
    /// The directory block holding the file's item.
    dir_blk: u32,
    /// The slot of the item within `dir_blk`.
    item_index: u8,
    /// The file size in bytes.
    size: u32,
    /// The first data block, or zero for an empty file.
    first_blk: u32,
    /// The data block the cursor sits on, or zero when the file is empty.
    cursor_blk: u32,
    /// The file offset of the first byte of `cursor_blk`, always a multiple
    /// of [`DATA_LEN`].
    cursor_pos: u32,
}

impl<D: BlockDevice> TinyFs<D> {
    /// Opens the file `name` of the current directory and returns its handle.
    ///
    /// Opening an already open file returns the existing handle and bumps its
    /// use count.
    pub fn open(&mut self, name: &str) -> Result<usize> {
        self.with_drive(|fs| fs.do_open(name))
    }

    fn do_open(&mut self, name: &str) -> Result<usize> {
        let Some(slot) = self.find_item(name)? else {
            return Err(Error::NotExist);
        };
        let item = slot.item();
        if item.item_type != ItemType::File {
            return Err(Error::NotExist);
        }
        let existing = self.fds.iter().position(|fd| {
            fd.usage > 0 && fd.dir_blk == slot.blk && fd.item_index as usize == slot.index
        });
        if let Some(i) = existing {
            self.fds[i].usage = self.fds[i].usage.saturating_add(1);
            return Ok(i);
        }
        let Some(i) = self.fds.iter().position(|fd| fd.usage == 0) else {
            return Err(Error::NoFreeFd);
        };
        self.fds[i] = Fd {
            usage: 1,
            dir_blk: slot.blk,
            item_index: slot.index as u8,
            size: item.size,
            first_blk: item.blk,
            cursor_blk: item.blk,
            cursor_pos: 0,
        };
        Ok(i)
    }

    /// Closes the handle `fd`, dropping one use count.
    pub fn close(&mut self, fd: usize) -> Result<()> {
        self.check_fd(fd)?;
        self.fds[fd].usage -= 1;
        Ok(())
    }

    /// Returns the directory item of `name`, or `None` when there is none.
    pub fn stat(&mut self, name: &str) -> Result<Option<DirItem>> {
        self.with_drive(|fs| Ok(fs.find_item(name)?.map(|slot| *slot.item())))
    }

    /// Creates the empty file `name` unless the name already exists, in which
    /// case nothing happens.
    pub fn touch(&mut self, name: &str) -> Result<()> {
        self.with_drive(|fs| {
            check_name(name)?;
            let mut slot = fs.reserve_item(name)?;
            if slot.item().item_type != ItemType::Free {
                return Ok(());
            }
            slot.dir.items[slot.index] = DirItem {
                blk: 0,
                size: 0,
                item_type: ItemType::File,
                name: name_key(name),
            };
            fs.write_dir_blk(slot.blk, &slot.dir)
        })
    }

    /// Deletes the file `name`. Directories are left alone.
    pub fn remove_file(&mut self, name: &str) -> Result<()> {
        self.with_drive(|fs| fs.do_delete(name, Some(ItemType::File)))
    }

    /// Deletes the empty directory `name`. Files are left alone.
    pub fn remove_dir(&mut self, name: &str) -> Result<()> {
        self.with_drive(|fs| fs.do_delete(name, Some(ItemType::Dir)))
    }

    /// Reads from the open file `fd` at byte offset `offset` into `buf`,
    /// returning the number of bytes read. Reads past the end of the file are
    /// clamped; a read starting at or past the end returns zero.
    pub fn read(&mut self, fd: usize, buf: &mut [u8], offset: u32) -> Result<usize> {
        self.with_drive(|fs| fs.do_read(fd, buf, offset))
    }

    fn do_read(&mut self, fd: usize, out: &mut [u8], offset: u32) -> Result<usize> {
        self.check_fd(fd)?;
        let size = self.fds[fd].size;
        if offset >= size {
            return Ok(0);
        }
        let len = out.len().min((size - offset) as usize);
        self.seek(fd, offset, false)?;
        let mut f = self.fds[fd];
        let mut buf = [0; BLOCK_SIZE];
        let mut done = 0;
        while done < len {
            self.dev.read_block(f.cursor_blk, &mut buf)?;
            let blk_off = offset as usize + done - f.cursor_pos as usize;
            let chunk = (len - done).min(DATA_LEN - blk_off);
            out[done..done + chunk].copy_from_slice(
                &buf[DATA_HEADER_LEN + blk_off..DATA_HEADER_LEN + blk_off + chunk],
            );
            done += chunk;
            if done < len {
                let (_, next) = data_links(&buf);
                if next == 0 {
                    return Err(Error::UnexpectedEof);
                }
                f.cursor_blk = next;
                f.cursor_pos += DATA_LEN as u32;
            }
        }
        self.fds[fd] = f;
        Ok(len)
    }

    /// Writes `data` to the open file `fd` at byte offset `offset`, growing
    /// the file as needed. Bytes between the old end of the file and `offset`
    /// read back as zero.
    pub fn write(&mut self, fd: usize, data: &[u8], offset: u32) -> Result<usize> {
        self.with_drive(|fs| fs.do_write(fd, data, offset))
    }

    fn do_write(&mut self, fd: usize, data: &[u8], offset: u32) -> Result<usize> {
        self.check_fd(fd)?;
        if data.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(u32::try_from(data.len()).map_err(|_| Error::DiskFull)?)
            .ok_or(Error::DiskFull)?;
        let old = self.fds[fd];
        self.seek(fd, offset, true)?;
        let mut f = self.fds[fd];
        let mut buf = [0; BLOCK_SIZE];
        let mut done = 0;
        while done < data.len() {
            self.dev.read_block(f.cursor_blk, &mut buf)?;
            let blk_off = offset as usize + done - f.cursor_pos as usize;
            let chunk = (data.len() - done).min(DATA_LEN - blk_off);
            buf[DATA_HEADER_LEN + blk_off..DATA_HEADER_LEN + blk_off + chunk]
                .copy_from_slice(&data[done..done + chunk]);
            done += chunk;
            if done < data.len() {
                let (prev, mut next) = data_links(&buf);
                if next == 0 {
                    // pre-allocate the next block of the chain
                    next = self.bitmap.alloc(&mut self.dev)?;
                    set_data_links(&mut buf, prev, next);
                    self.dev.write_block(f.cursor_blk, &buf)?;
                    let mut fresh = [0; BLOCK_SIZE];
                    set_data_links(&mut fresh, f.cursor_blk, 0);
                    self.dev.write_block(next, &fresh)?;
                } else {
                    self.dev.write_block(f.cursor_blk, &buf)?;
                }
                f.cursor_blk = next;
                f.cursor_pos += DATA_LEN as u32;
            } else {
                self.dev.write_block(f.cursor_blk, &buf)?;
            }
        }
        if end > f.size {
            f.size = end;
        }
        self.fds[fd] = f;
        if f.size != old.size || f.first_blk != old.first_blk {
            self.update_item(f.dir_blk, f.item_index as usize, f.first_blk, f.size)?;
        }
        Ok(data.len())
    }

    /// Truncates or extends the open file `fd` to `new_size` bytes. Extending
    /// zero-fills the new range.
    pub fn trunc(&mut self, fd: usize, new_size: u32) -> Result<()> {
        self.with_drive(|fs| fs.do_trunc(fd, new_size))
    }

    fn do_trunc(&mut self, fd: usize, new_size: u32) -> Result<()> {
        self.check_fd(fd)?;
        let old = self.fds[fd];
        if new_size == 0 {
            if old.first_blk != 0 {
                self.free_chain(old.first_blk)?;
            }
            let f = &mut self.fds[fd];
            f.first_blk = 0;
            f.cursor_blk = 0;
            f.cursor_pos = 0;
            f.size = 0;
        } else {
            // land on the block holding the last byte, extending if needed
            self.seek(fd, new_size - 1, true)?;
            let mut f = self.fds[fd];
            let mut buf = [0; BLOCK_SIZE];
            self.dev.read_block(f.cursor_blk, &mut buf)?;
            let (prev, next) = data_links(&buf);
            let mut dirty = false;
            if next != 0 {
                set_data_links(&mut buf, prev, 0);
                dirty = true;
            }
            if new_size < old.size {
                // stale bytes past the new end must read back as zero if the
                // file grows again later
                let keep = (new_size - f.cursor_pos) as usize;
                buf[DATA_HEADER_LEN + keep..].fill(0);
                dirty = true;
            }
            if dirty {
                self.dev.write_block(f.cursor_blk, &buf)?;
            }
            if next != 0 {
                self.free_chain(next)?;
            }
            f.size = new_size;
            self.fds[fd] = f;
        }
        let f = self.fds[fd];
        if f.size != old.size || f.first_blk != old.first_blk {
            self.update_item(f.dir_blk, f.item_index as usize, f.first_blk, f.size)?;
        }
        Ok(())
    }

    /// Moves the cursor of `fd` onto the data block covering the byte offset
    /// `target`.
    ///
    /// Without `append`, the call fails with [`Error::UnexpectedEof`] when
    /// the chain ends before `target`. With `append`, the chain is extended
    /// with zero-filled blocks until it covers `target`.
    fn seek(&mut self, fd: usize, target: u32, append: bool) -> Result<()> {
        let mut f = self.fds[fd];
        let mut buf = [0; BLOCK_SIZE];

        if target == 0 || f.cursor_blk == 0 {
            f.cursor_blk = f.first_blk;
            f.cursor_pos = 0;
        }
        // walk backward while the cursor block starts past the target
        while f.cursor_blk != 0 && f.cursor_pos > target {
            self.dev.read_block(f.cursor_blk, &mut buf)?;
            let (prev, _) = data_links(&buf);
            if prev == 0 {
                return Err(Error::UnexpectedEof);
            }
            f.cursor_blk = prev;
            f.cursor_pos -= DATA_LEN as u32;
        }
        // walk forward while the target lies past the cursor block
        while f.cursor_blk != 0 && f.cursor_pos + DATA_LEN as u32 <= target {
            self.dev.read_block(f.cursor_blk, &mut buf)?;
            let (_, next) = data_links(&buf);
            if next == 0 {
                break;
            }
            f.cursor_blk = next;
            f.cursor_pos += DATA_LEN as u32;
        }
        if f.cursor_blk != 0 && f.cursor_pos + DATA_LEN as u32 > target {
            self.fds[fd] = f;
            return Ok(());
        }
        if !append {
            return Err(Error::UnexpectedEof);
        }
        // extend the chain until a block covers the target
        loop {
            let new_blk = self.bitmap.alloc(&mut self.dev)?;
            if f.cursor_blk == 0 {
                f.first_blk = new_blk;
            } else {
                self.dev.read_block(f.cursor_blk, &mut buf)?;
                let (prev, _) = data_links(&buf);
                set_data_links(&mut buf, prev, new_blk);
                self.dev.write_block(f.cursor_blk, &buf)?;
                f.cursor_pos += DATA_LEN as u32;
            }
            buf.fill(0);
            set_data_links(&mut buf, f.cursor_blk, 0);
            self.dev.write_block(new_blk, &buf)?;
            f.cursor_blk = new_blk;
            if f.cursor_pos + DATA_LEN as u32 > target {
                break;
            }
        }
        self.fds[fd] = f;
        Ok(())
    }

    /// Checks that `fd` designates an open handle.
    fn check_fd(&self, fd: usize) -> Result<()> {
        if self.fds.get(fd).is_some_and(|f| f.usage > 0) {
            Ok(())
        } else {
            Err(Error::InvalFd)
        }
    }

    /// Repoints open handles at the directory block `from` to `to`.
    ///
    /// Chain compaction moves a whole block's items to another block number
    /// when an empty head hands its number to its successor; handles keep
    /// their slot index but must track the new block, or later writes would
    /// update the item's old, freed location.
    pub(crate) fn relocate_fds(&mut self, from: u32, to: u32) {
        for f in &mut self.fds {
            if f.usage > 0 && f.dir_blk == from {
                f.dir_blk = to;
            }
        }
    }

    /// Fails with [`Error::FileBusy`] when an open handle targets the item at
    /// `(dir_blk, index)`.
    pub(crate) fn check_busy(&self, dir_blk: u32, index: usize) -> Result<()> {
        let busy = self
            .fds
            .iter()
            .any(|f| f.usage > 0 && f.dir_blk == dir_blk && f.item_index as usize == index);
        if busy {
            Err(Error::FileBusy)
        } else {
            Ok(())
        }
    }

    /// Rewrites the `blk`/`size` fields of the directory item at
    /// `(dir_blk, index)`.
    fn update_item(&mut self, dir_blk: u32, index: usize, first: u32, size: u32) -> Result<()> {
        let mut dir = self.read_dir_blk(dir_blk)?;
        dir.items[index].blk = first;
        dir.items[index].size = size;
        self.write_dir_blk(dir_blk, &dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dir::DIR_BLK_ITEMS;
    use crate::tests::{check_consistency, test_fs};
    use rand::{Rng, SeedableRng};

    #[test]
    fn open_close_refcount() {
        let mut fs = test_fs(8192);
        fs.touch("a").unwrap();
        let fd = fs.open("a").unwrap();
        // a second open returns the same handle
        assert_eq!(fs.open("a").unwrap(), fd);
        fs.close(fd).unwrap();
        // still open once
        fs.read(fd, &mut [], 0).unwrap();
        fs.close(fd).unwrap();
        assert!(matches!(fs.read(fd, &mut [], 0), Err(Error::InvalFd)));
        assert!(matches!(fs.close(fd), Err(Error::InvalFd)));
        assert!(matches!(fs.close(MAX_FDS), Err(Error::InvalFd)));
        assert!(matches!(fs.open("nope"), Err(Error::NotExist)));
    }

    #[test]
    fn handle_table_exhaustion() {
        let mut fs = test_fs(8192);
        for i in 0..MAX_FDS {
            fs.touch(&format!("f{i}")).unwrap();
            fs.open(&format!("f{i}")).unwrap();
        }
        fs.touch("straw").unwrap();
        assert!(matches!(fs.open("straw"), Err(Error::NoFreeFd)));
        fs.close(0).unwrap();
        fs.open("straw").unwrap();
    }

    #[test]
    fn stat_and_touch() {
        let mut fs = test_fs(8192);
        assert!(fs.stat("a").unwrap().is_none());
        fs.touch("a").unwrap();
        let item = fs.stat("a").unwrap().unwrap();
        assert_eq!(item.item_type, ItemType::File);
        assert_eq!(item.size, 0);
        assert_eq!(item.blk, 0);
        // touching an existing file is a no-op
        fs.write_file("a", &[1, 2, 3], true).unwrap();
        fs.touch("a").unwrap();
        assert_eq!(fs.stat("a").unwrap().unwrap().size, 3);
    }

    #[test]
    fn positioned_read_write() {
        let mut fs = test_fs(8192);
        fs.touch("a").unwrap();
        let fd = fs.open("a").unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x1f5);
        let mut data = vec![0u8; 3000];
        rng.fill(&mut data[..]);
        assert_eq!(fs.write(fd, &data, 0).unwrap(), data.len());
        assert_eq!(fs.stat("a").unwrap().unwrap().size, 3000);

        let mut buf = vec![0; 3000];
        assert_eq!(fs.read(fd, &mut buf, 0).unwrap(), 3000);
        assert_eq!(buf, data);
        // a read crossing block boundaries, away from the cursor
        let mut buf = [0; 100];
        assert_eq!(fs.read(fd, &mut buf, 950).unwrap(), 100);
        assert_eq!(&buf[..], &data[950..1050]);
        // reads past the end clamp, reads at the end return nothing
        assert_eq!(fs.read(fd, &mut buf, 2950).unwrap(), 50);
        assert_eq!(&buf[..50], &data[2950..]);
        assert_eq!(fs.read(fd, &mut buf, 3000).unwrap(), 0);
        fs.close(fd).unwrap();
        check_consistency(&mut fs);
    }

    #[test]
    fn overwrite_in_place() {
        let mut fs = test_fs(8192);
        fs.write_file("a", &[0x11; 1200], false).unwrap();
        let fd = fs.open("a").unwrap();
        fs.write(fd, &[0x22; 600], 300).unwrap();
        // size unchanged, contents patched across two blocks
        assert_eq!(fs.stat("a").unwrap().unwrap().size, 1200);
        let mut buf = [0; 1200];
        fs.read(fd, &mut buf, 0).unwrap();
        assert!(buf[..300].iter().all(|b| *b == 0x11));
        assert!(buf[300..900].iter().all(|b| *b == 0x22));
        assert!(buf[900..].iter().all(|b| *b == 0x11));
        fs.close(fd).unwrap();
        check_consistency(&mut fs);
    }

    #[test]
    fn sparse_write_zero_fills() {
        let mut fs = test_fs(8192);
        fs.touch("a").unwrap();
        let fd = fs.open("a").unwrap();
        // write far past the start of the empty file
        fs.write(fd, &[0xff; 10], 1500).unwrap();
        assert_eq!(fs.stat("a").unwrap().unwrap().size, 1510);
        let mut buf = vec![0x55u8; 1510];
        fs.read(fd, &mut buf, 0).unwrap();
        assert!(buf[..1500].iter().all(|b| *b == 0));
        assert!(buf[1500..].iter().all(|b| *b == 0xff));
        fs.close(fd).unwrap();
        check_consistency(&mut fs);
    }

    #[test]
    fn trunc_shrink_and_grow() {
        let mut fs = test_fs(8192);
        let data: Vec<u8> = (0..2000).map(|i| i as u8).collect();
        fs.write_file("a", &data, false).unwrap();
        let fd = fs.open("a").unwrap();
        let base = fs.used_count().unwrap();

        // shrink into the first block
        fs.trunc(fd, 100).unwrap();
        assert_eq!(fs.stat("a").unwrap().unwrap().size, 100);
        assert_eq!(fs.used_count().unwrap(), base - 3);
        let mut buf = [0; 200];
        assert_eq!(fs.read(fd, &mut buf, 0).unwrap(), 100);
        assert_eq!(&buf[..100], &data[..100]);
        check_consistency(&mut fs);

        // grow again: the new range reads back as zero
        fs.trunc(fd, 1000).unwrap();
        assert_eq!(fs.stat("a").unwrap().unwrap().size, 1000);
        let mut buf = vec![0x55u8; 1000];
        fs.read(fd, &mut buf, 0).unwrap();
        assert_eq!(&buf[..100], &data[..100]);
        assert!(buf[100..].iter().all(|b| *b == 0));
        check_consistency(&mut fs);

        // truncate to nothing releases the whole chain
        fs.trunc(fd, 0).unwrap();
        let item = fs.stat("a").unwrap().unwrap();
        assert_eq!(item.size, 0);
        assert_eq!(item.blk, 0);
        assert_eq!(fs.used_count().unwrap(), base - 4);
        fs.close(fd).unwrap();
        check_consistency(&mut fs);
    }

    #[test]
    fn trunc_to_block_boundary() {
        let mut fs = test_fs(8192);
        fs.write_file("a", &vec![0x77; 2 * DATA_LEN + 10], false)
            .unwrap();
        let fd = fs.open("a").unwrap();
        // exactly two blocks must remain
        fs.trunc(fd, 2 * DATA_LEN as u32).unwrap();
        fs.close(fd).unwrap();
        assert_eq!(fs.stat("a").unwrap().unwrap().size, 2 * DATA_LEN as u32);
        check_consistency(&mut fs);
    }

    #[test]
    fn busy_interlock() {
        let mut fs = test_fs(8192);
        fs.write_file("a", &[1, 2, 3], false).unwrap();
        let fd = fs.open("a").unwrap();
        assert!(matches!(fs.delete("a"), Err(Error::FileBusy)));
        assert!(matches!(
            fs.write_file("a", &[4], true),
            Err(Error::FileBusy)
        ));
        fs.close(fd).unwrap();
        fs.write_file("a", &[4], true).unwrap();
        fs.delete("a").unwrap();
        check_consistency(&mut fs);
    }

    #[test]
    fn hand_off_follows_open_handles() {
        let mut fs = test_fs(8192);
        // 24 files: the 24th lands in the second chain block
        for i in 0..DIR_BLK_ITEMS + 1 {
            fs.write_file(&format!("f{i:02}"), &[i as u8], false).unwrap();
        }
        let fd = fs.open("f23").unwrap();
        // emptying the head hands its block number to the second block, the
        // one the open handle points into
        for i in 0..DIR_BLK_ITEMS {
            fs.delete(&format!("f{i:02}")).unwrap();
        }
        fs.write(fd, &[0xcd; 20], 0).unwrap();
        fs.close(fd).unwrap();
        // the write went to the item's new location, not the freed block
        assert_eq!(fs.stat("f23").unwrap().unwrap().size, 20);
        let mut buf = [0; 32];
        assert_eq!(fs.read_file("f23", &mut buf).unwrap(), 20);
        assert!(buf[..20].iter().all(|b| *b == 0xcd));
        check_consistency(&mut fs);
    }

    #[test]
    fn typed_removal() {
        let mut fs = test_fs(8192);
        fs.create_dir("d").unwrap();
        fs.write_file("f", &[1], false).unwrap();
        assert!(matches!(fs.remove_file("d"), Err(Error::NotExist)));
        assert!(matches!(fs.remove_dir("f"), Err(Error::NotExist)));
        fs.remove_dir("d").unwrap();
        fs.remove_file("f").unwrap();
        assert_eq!(fs.used_count().unwrap(), 2);
        check_consistency(&mut fs);
    }
}
