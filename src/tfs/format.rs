//! Filesystem creation: writes the allocation bitmaps over the whole device
//! and creates the root directory.

use crate::bitmap::BITMAP_BLK_BITS;
use crate::dev::{BlockDevice, BLOCK_SIZE};
use crate::dir::DirBlock;
use crate::{Result, TinyFs, FIRST_BITMAP_BLK};

/// The phases a running format goes through, in order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FormatState {
    /// The format is about to begin.
    Start,
    /// The bitmap sweep begins.
    BitmapStart,
    /// All bitmap blocks are written.
    BitmapDone,
    /// The root directory is being created.
    RootDir,
    /// The device is ready.
    Done,
}

/// An observer notified of the progress of a [`format`](TinyFs::format) run,
/// e.g. to drive a progress display. All notifications default to doing
/// nothing.
pub trait FormatObserver {
    /// The format entered the phase `state`.
    fn state(&mut self, _state: FormatState) {}

    /// The bitmap sweep reached block `pos` of `max`.
    fn progress(&mut self, _pos: u32, _max: u32) {}
}

/// The silent observer.
impl FormatObserver for () {}

impl<D: BlockDevice> TinyFs<D> {
    /// Creates a fresh filesystem on the device, destroying whatever it held.
    pub fn format(&mut self) -> Result<()> {
        self.format_with(&mut ())
    }

    /// Like [`format`](Self::format), reporting progress to `observer`.
    pub fn format_with(&mut self, observer: &mut dyn FormatObserver) -> Result<()> {
        self.with_drive(|fs| fs.do_format(observer))
    }

    fn do_format(&mut self, observer: &mut dyn FormatObserver) -> Result<()> {
        observer.state(FormatState::Start);
        observer.state(FormatState::BitmapStart);
        let blk_count = self.dev.info().blk_count;
        let last_blk = self.bitmap.last_blk();
        let last_len = self.bitmap.last_len();
        let mut buf = [0; BLOCK_SIZE];
        let mut pos = FIRST_BITMAP_BLK;
        loop {
            observer.progress(pos, blk_count);
            buf.fill(0);
            // the bitmap block occupies itself
            buf[0] = 0x01;
            if pos == last_blk && (last_len as usize) < BLOCK_SIZE * 8 {
                // mark the region past the device end as permanently used
                let first = last_len as usize / 8;
                buf[first] |= 0xff << (last_len % 8);
                for b in &mut buf[first + 1..] {
                    *b = 0xff;
                }
            }
            self.dev.write_block(pos, &buf)?;
            if pos == last_blk {
                break;
            }
            pos += BITMAP_BLK_BITS;
        }
        observer.state(FormatState::BitmapDone);
        self.bitmap.load(&mut self.dev, FIRST_BITMAP_BLK)?;

        observer.state(FormatState::RootDir);
        // the first free bit lands on block 1
        let root = self.bitmap.alloc(&mut self.dev)?;
        self.write_dir_blk(root, &DirBlock::first(0))?;
        self.cur_dir = root;
        observer.state(FormatState::Done);
        Ok(())
    }
}
