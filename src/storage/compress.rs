//! Bounded-output block compression for leaf items.
//!
//! The compressor accumulates encoded single/array items and promises that
//! the finished container item never exceeds the byte budget it was opened
//! with. `add` is monotone: after the first refusal every further `add`
//! refuses too, and the batch is finished as-is. When compression would
//! not shrink the batch, `finish` reports failure and the caller stores
//! the items uncompressed.

use std::convert::TryFrom;

use crate::error::{Result, ZedError};
use crate::storage::item::{
    CompressedItem, Item, UncompressedItem, COMPRESSED_HEADER_LEN, ITEM_COMPRESSED,
};
use crate::types::Tid;

/// Worst-case LZ4 block growth for `len` input bytes.
fn compress_bound(len: usize) -> usize {
    len + len / 255 + 16
}

pub struct Compressor {
    budget: usize,
    raw: Vec<u8>,
    items: Vec<UncompressedItem>,
    first_tid: Tid,
    last_tid: Tid,
    full: bool,
    finished: Option<Option<CompressedItem>>,
}

impl Compressor {
    /// Opens a batch whose finished container item (header included) must
    /// fit in `budget` bytes.
    pub fn begin(budget: usize) -> Compressor {
        Compressor {
            budget,
            raw: Vec::new(),
            items: Vec::new(),
            first_tid: Tid::INVALID,
            last_tid: Tid::INVALID,
            full: false,
            finished: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn payload_budget(&self) -> usize {
        self.budget.saturating_sub(COMPRESSED_HEADER_LEN)
    }

    /// Tries to admit `item` into the batch. Returns `false` once the batch
    /// is full; the refusal is sticky.
    pub fn add(&mut self, item: &UncompressedItem) -> bool {
        if self.full || self.finished.is_some() {
            self.full = true;
            return false;
        }
        let start = self.raw.len();
        item.encode_into(&mut self.raw);
        if self.raw.len() > u16::MAX as usize {
            self.raw.truncate(start);
            self.full = true;
            return false;
        }
        let fits = compress_bound(self.raw.len()) <= self.payload_budget()
            || lz4_flex::block::compress(&self.raw).len() <= self.payload_budget();
        if !fits {
            self.raw.truncate(start);
            self.full = true;
            return false;
        }
        if self.items.is_empty() {
            self.first_tid = item.tid;
        }
        self.last_tid = item.last_tid();
        self.items.push(item.clone());
        true
    }

    /// Closes the batch. `None` means compression did not shrink the
    /// payload; the caller should store the batch uncompressed. Calling
    /// again returns the same answer.
    pub fn finish(&mut self) -> Option<CompressedItem> {
        if let Some(cached) = &self.finished {
            return cached.clone();
        }
        let result = if self.items.is_empty() {
            None
        } else {
            let compressed = lz4_flex::block::compress(&self.raw);
            if compressed.len() + COMPRESSED_HEADER_LEN >= self.raw.len() {
                None
            } else {
                debug_assert!(compressed.len() <= self.payload_budget());
                Some(CompressedItem {
                    tid: self.first_tid,
                    lasttid: self.last_tid,
                    uncompressed_size: u16::try_from(self.raw.len())
                        .expect("raw batch bounded by u16 in add"),
                    payload: compressed,
                })
            }
        };
        self.finished = Some(result.clone());
        result
    }

    /// Hands back the buffered items, for the store-uncompressed fallback.
    pub fn into_items(self) -> Vec<UncompressedItem> {
        self.items
    }
}

/// Replays the contents of a compressed container as owned items.
pub struct Decompressor {
    raw: Vec<u8>,
    pos: usize,
}

impl Decompressor {
    pub fn new(container: &CompressedItem) -> Result<Decompressor> {
        let raw = lz4_flex::block::decompress(
            &container.payload,
            container.uncompressed_size as usize,
        )
        .map_err(|e| ZedError::Corruption(format!("compressed item does not inflate: {e}")))?;
        if raw.len() != container.uncompressed_size as usize {
            return Err(ZedError::Corruption(
                "compressed item inflates to the wrong size".into(),
            ));
        }
        Ok(Decompressor { raw, pos: 0 })
    }

    /// Returns the next contained item, or `None` at the end. Containers
    /// never nest; finding one inside is corruption.
    pub fn next_item(&mut self) -> Result<Option<UncompressedItem>> {
        if self.pos >= self.raw.len() {
            return Ok(None);
        }
        let buf = &self.raw[self.pos..];
        if buf.len() < 12 {
            return Err(ZedError::Corruption("truncated item in container".into()));
        }
        let size = u16::from_be_bytes(buf[8..10].try_into().unwrap()) as usize;
        let flags = u16::from_be_bytes(buf[10..12].try_into().unwrap());
        if flags & ITEM_COMPRESSED != 0 {
            return Err(ZedError::Corruption(
                "nested compressed item in container".into(),
            ));
        }
        if size < 12 || size > buf.len() {
            return Err(ZedError::Corruption("bad item size in container".into()));
        }
        let item = match Item::decode(&buf[..size])? {
            Item::Uncompressed(item) => item,
            Item::Compressed(_) => unreachable!("flag checked above"),
        };
        self.pos += size;
        Ok(Some(item))
    }

    /// Rewinds to the first contained item.
    pub fn restart(&mut self) {
        self.pos = 0;
    }
}
