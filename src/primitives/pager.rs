//! Page buffer adapter.
//!
//! Loans fixed-size pages to callers as pin + lock handles. Pins keep a
//! frame resident; locks guard the frame's bytes. The adapter is policy
//! free: the tree layers enforce their own lock ordering on top of it.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};

use crate::error::{Result, ZedError};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::{BlockNumber, PAGE_SIZE};

/// Configuration knobs for the pager.
#[derive(Clone, Debug)]
pub struct PagerOptions {
    /// Whether `flush` issues an fsync after writing dirty frames.
    pub sync_on_flush: bool,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            sync_on_flush: true,
        }
    }
}

/// One resident page frame. The buffer lives behind its own lock so that
/// guards can be detached from the frame table and carried across calls.
pub struct Frame {
    buf: Arc<RwLock<Box<[u8]>>>,
    dirty: AtomicBool,
    pins: AtomicU32,
}

impl Frame {
    fn new_zeroed() -> Self {
        Self {
            buf: Arc::new(RwLock::new(vec![0u8; PAGE_SIZE].into_boxed_slice())),
            dirty: AtomicBool::new(false),
            pins: AtomicU32::new(0),
        }
    }

    fn new_from(bytes: Box<[u8]>) -> Self {
        Self {
            buf: Arc::new(RwLock::new(bytes)),
            dirty: AtomicBool::new(false),
            pins: AtomicU32::new(0),
        }
    }
}

struct PagerState {
    frames: HashMap<BlockNumber, Arc<Frame>>,
    nblocks: BlockNumber,
    free: Vec<BlockNumber>,
}

/// Page buffer adapter over a single table file.
pub struct Pager {
    io: Arc<dyn FileIo>,
    state: Mutex<PagerState>,
    options: PagerOptions,
}

impl Pager {
    /// Creates a fresh, empty table file.
    pub fn create(path: impl AsRef<Path>, options: PagerOptions) -> Result<Self> {
        let io = StdFileIo::open(path)?;
        io.truncate(0)?;
        Ok(Self {
            io: Arc::new(io),
            state: Mutex::new(PagerState {
                frames: HashMap::new(),
                nblocks: 0,
                free: Vec::new(),
            }),
            options,
        })
    }

    /// Opens an existing table file.
    pub fn open(path: impl AsRef<Path>, options: PagerOptions) -> Result<Self> {
        let io = StdFileIo::open(path)?;
        let len = io.len()?;
        if len % PAGE_SIZE as u64 != 0 {
            return Err(ZedError::Corruption(format!(
                "file length {len} is not a multiple of the page size"
            )));
        }
        let nblocks = (len / PAGE_SIZE as u64) as BlockNumber;
        Ok(Self {
            io: Arc::new(io),
            state: Mutex::new(PagerState {
                frames: HashMap::new(),
                nblocks,
                free: Vec::new(),
            }),
            options,
        })
    }

    /// Number of blocks in the table, counting unflushed extensions.
    pub fn nblocks(&self) -> BlockNumber {
        self.state.lock().nblocks
    }

    /// Pins the frame for `blk`, loading it from disk on first touch.
    pub fn pin(&self, blk: BlockNumber) -> Result<PinnedPage> {
        let frame = {
            let mut state = self.state.lock();
            if blk >= state.nblocks {
                return Err(ZedError::corrupt_at(blk, "pin beyond end of table"));
            }
            match state.frames.get(&blk) {
                Some(frame) => frame.clone(),
                None => {
                    let mut bytes = vec![0u8; PAGE_SIZE].into_boxed_slice();
                    self.io.read_at(blk as u64 * PAGE_SIZE as u64, &mut bytes)?;
                    let frame = Arc::new(Frame::new_from(bytes));
                    state.frames.insert(blk, frame.clone());
                    frame
                }
            }
        };
        frame.pins.fetch_add(1, Ordering::AcqRel);
        Ok(PinnedPage { frame, blk })
    }

    /// Allocates a new page: reuses a recycled block if one is available,
    /// otherwise extends the table by one block. The frame comes back
    /// zeroed and pinned; the caller initializes and locks it.
    pub fn new_page(&self) -> Result<(PinnedPage, BlockNumber)> {
        let (frame, blk) = {
            let mut state = self.state.lock();
            let blk = match state.free.pop() {
                Some(blk) => blk,
                None => {
                    let blk = state.nblocks;
                    state.nblocks += 1;
                    blk
                }
            };
            let frame = Arc::new(Frame::new_zeroed());
            state.frames.insert(blk, frame.clone());
            (frame, blk)
        };
        frame.pins.fetch_add(1, Ordering::AcqRel);
        Ok((PinnedPage { frame, blk }, blk))
    }

    /// Returns `blk` to the recycle list. The caller must hold no pins on it.
    pub fn free_page(&self, blk: BlockNumber) -> Result<()> {
        let mut state = self.state.lock();
        if blk >= state.nblocks {
            return Err(ZedError::corrupt_at(blk, "freeing block beyond end of table"));
        }
        if let Some(frame) = state.frames.get(&blk) {
            if frame.pins.load(Ordering::Acquire) > 0 {
                return Err(ZedError::corrupt_at(blk, "freeing a pinned page"));
            }
        }
        state.free.push(blk);
        Ok(())
    }

    /// Drops one pin and takes another; the common walk-right idiom.
    pub fn release_and_read(&self, pin: PinnedPage, blk: BlockNumber) -> Result<PinnedPage> {
        if pin.block() == blk {
            return Ok(pin);
        }
        drop(pin);
        self.pin(blk)
    }

    /// Writes every dirty frame back to the file.
    pub fn flush(&self) -> Result<()> {
        let frames: Vec<(BlockNumber, Arc<Frame>)> = {
            let state = self.state.lock();
            state
                .frames
                .iter()
                .map(|(blk, frame)| (*blk, frame.clone()))
                .collect()
        };
        for (blk, frame) in frames {
            if frame.dirty.swap(false, Ordering::AcqRel) {
                let guard = frame.buf.read();
                self.io.write_at(blk as u64 * PAGE_SIZE as u64, &guard)?;
            }
        }
        if self.options.sync_on_flush {
            self.io.sync_all()?;
        }
        Ok(())
    }
}

/// A pinned page. The frame stays resident while any pin is alive; the pin
/// is released on drop, on every exit path.
pub struct PinnedPage {
    frame: Arc<Frame>,
    blk: BlockNumber,
}

impl PinnedPage {
    pub fn block(&self) -> BlockNumber {
        self.blk
    }

    /// Takes a shared lock on the page contents.
    pub fn read(&self) -> SharedPageGuard {
        SharedPageGuard {
            guard: RwLock::read_arc(&self.frame.buf),
            pin: self.clone(),
        }
    }

    /// Takes an exclusive lock on the page contents.
    pub fn write(&self) -> ExclusivePageGuard {
        ExclusivePageGuard {
            guard: RwLock::write_arc(&self.frame.buf),
            pin: self.clone(),
        }
    }

    pub fn mark_dirty(&self) {
        self.frame.dirty.store(true, Ordering::Release);
    }
}

impl Clone for PinnedPage {
    fn clone(&self) -> Self {
        self.frame.pins.fetch_add(1, Ordering::AcqRel);
        Self {
            frame: self.frame.clone(),
            blk: self.blk,
        }
    }
}

impl Drop for PinnedPage {
    fn drop(&mut self) {
        self.frame.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Shared lock over a pinned page's bytes.
pub struct SharedPageGuard {
    guard: ArcRwLockReadGuard<RawRwLock, Box<[u8]>>,
    pin: PinnedPage,
}

impl SharedPageGuard {
    pub fn block(&self) -> BlockNumber {
        self.pin.block()
    }

    /// Drops the lock but keeps the pin.
    pub fn unlock(self) -> PinnedPage {
        self.pin.clone()
    }
}

impl Deref for SharedPageGuard {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

/// Exclusive lock over a pinned page's bytes.
pub struct ExclusivePageGuard {
    guard: ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>,
    pin: PinnedPage,
}

impl std::fmt::Debug for ExclusivePageGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExclusivePageGuard")
            .field("block", &self.pin.block())
            .finish()
    }
}

impl ExclusivePageGuard {
    pub fn block(&self) -> BlockNumber {
        self.pin.block()
    }

    pub fn mark_dirty(&self) {
        self.pin.mark_dirty();
    }

    /// Drops the lock but keeps the pin.
    pub fn unlock(self) -> PinnedPage {
        self.pin.clone()
    }
}

impl Deref for ExclusivePageGuard {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

impl DerefMut for ExclusivePageGuard {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.guard
    }
}
