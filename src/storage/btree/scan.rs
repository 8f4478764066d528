//! Leaf scan in TID order.
//!
//! A scan pins the leaf it is positioned on but holds the page lock only
//! while copying items into its own memory; across yields to the caller
//! just the pin survives. Compressed containers are inflated into a
//! scan-owned decompressor, and array items are materialized into an
//! element buffer, both drained before the page is visited again.

use std::collections::VecDeque;

use crate::error::{Result, ZedError};
use crate::primitives::pager::PinnedPage;
use crate::storage::btree::{descend, Rel};
use crate::storage::compress::Decompressor;
use crate::storage::item::{self, AttrDesc, CompressedItem, Item, UncompressedItem};
use crate::storage::page;
use crate::storage::txn::Snapshot;
use crate::storage::visibility::satisfies_visibility;
use crate::types::{BlockNumber, Tid, UndoPtr, INVALID_BLOCK};

/// One tuple out of a scan: the TID and the datum (`None` for null).
pub type ScanTuple = (Tid, Option<Vec<u8>>);

pub struct TreeScan<'a> {
    rel: &'a Rel,
    attno: u16,
    desc: AttrDesc,
    snapshot: Snapshot,
    /// Sampled once at scan start; visibility is memoized against it.
    recent_oldest: UndoPtr,
    nexttid: Tid,
    endtid: Tid,
    lastbuf: Option<PinnedPage>,
    active: bool,
    decompressor: Option<Decompressor>,
    elements: VecDeque<ScanTuple>,
}

enum PageStep {
    Found(UncompressedItem),
    Inflate(CompressedItem),
    PastEnd,
    WalkRight(BlockNumber),
}

impl<'a> TreeScan<'a> {
    /// Positions a scan at the leaf containing `start`. An attribute with
    /// no tree yet yields an inactive scan that returns no tuples.
    pub(crate) fn begin(
        rel: &'a Rel,
        attno: u16,
        desc: AttrDesc,
        start: Tid,
        end: Tid,
        snapshot: Snapshot,
    ) -> Result<TreeScan<'a>> {
        let recent_oldest = rel.undo.oldest_live()?;
        let lastbuf = descend(rel, attno, start, 0, false)?.map(|guard| guard.unlock());
        Ok(TreeScan {
            rel,
            attno,
            desc,
            snapshot,
            recent_oldest,
            nexttid: start,
            endtid: end,
            active: lastbuf.is_some(),
            lastbuf,
            decompressor: None,
            elements: VecDeque::new(),
        })
    }

    /// Returns the next visible tuple in strictly ascending TID order, or
    /// `None` when the range is exhausted.
    pub fn next(&mut self) -> Result<Option<ScanTuple>> {
        loop {
            if let Some((tid, datum)) = self.elements.pop_front() {
                self.nexttid = tid.next();
                return Ok(Some((tid, datum)));
            }
            if !self.fill()? {
                return Ok(None);
            }
        }
    }

    /// Join helper: advances to `tid` and returns its datum, `None` if no
    /// visible tuple lives there. `tid` must not go backwards between
    /// calls.
    pub fn fetch(&mut self, tid: Tid) -> Result<Option<Option<Vec<u8>>>> {
        while let Some((front, _)) = self.elements.front() {
            if *front >= tid {
                break;
            }
            self.elements.pop_front();
        }
        if self.elements.is_empty() && tid > self.nexttid {
            self.nexttid = tid;
        }
        loop {
            if let Some((front, _)) = self.elements.front() {
                if *front > tid {
                    return Ok(None);
                }
                let (etid, datum) = self.elements.pop_front().expect("front checked");
                self.nexttid = etid.next();
                return Ok(Some(datum));
            }
            if !self.fill()? {
                return Ok(None);
            }
            while let Some((front, _)) = self.elements.front() {
                if *front >= tid {
                    break;
                }
                self.elements.pop_front();
            }
        }
    }

    /// The scan's snapshot; Dirty snapshots report the blocking xids
    /// through its `xmin`/`xmax` fields.
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Releases the scan's pins and buffers.
    pub fn end(self) {}

    fn finish(&mut self) {
        self.active = false;
        self.lastbuf = None;
        self.decompressor = None;
    }

    /// Pulls the next visible item and materializes its elements into the
    /// buffer. False when the scan is done.
    fn fill(&mut self) -> Result<bool> {
        loop {
            let Some(item) = self.next_item()? else {
                return Ok(false);
            };
            if item.tid >= self.endtid {
                self.finish();
                return Ok(false);
            }
            let visible = satisfies_visibility(
                &self.rel.undo,
                &self.rel.txm,
                &mut self.snapshot,
                self.recent_oldest,
                &item,
            )?;
            if !visible {
                self.nexttid = item.last_tid().next();
                continue;
            }
            let skip = if item.tid < self.nexttid {
                (self.nexttid.0 - item.tid.0) as usize
            } else {
                0
            };
            let mut reached_end = false;
            for (tid, datum) in item.elements(&self.desc)?.skip(skip) {
                if tid >= self.endtid {
                    reached_end = true;
                    break;
                }
                self.elements.push_back((tid, datum.map(|d| d.to_vec())));
            }
            if reached_end {
                // nothing past this item can be in range
                self.finish();
            }
            if self.elements.is_empty() {
                return Ok(false);
            }
            return Ok(true);
        }
    }

    /// The next raw item whose range reaches `nexttid`, without regard to
    /// visibility. Decompressed leftovers drain first, then on-page
    /// items, then the right sibling.
    fn next_item(&mut self) -> Result<Option<UncompressedItem>> {
        if !self.active {
            return Ok(None);
        }
        loop {
            if let Some(decompressor) = self.decompressor.as_mut() {
                while let Some(item) = decompressor.next_item()? {
                    if item.last_tid() >= self.nexttid {
                        return Ok(Some(item));
                    }
                }
                self.decompressor = None;
            }

            let step = {
                let pin = match self.lastbuf.as_ref() {
                    Some(pin) => pin,
                    None => {
                        self.active = false;
                        return Ok(None);
                    }
                };
                let guard = pin.read();
                let blk = guard.block();
                let opaque = page::tree_opaque(&guard)
                    .map_err(|_| ZedError::corrupt_at(blk, "scan reached a non-tree page"))?;
                if opaque.attno != self.attno || !opaque.is_leaf() {
                    return Err(ZedError::corrupt_at(blk, "scan reached the wrong tree"));
                }
                let mut step = None;
                for off in 1..=page::max_offset(&guard) {
                    let raw = page::item(&guard, off)?;
                    let (first, last) = item::peek_tid_range(raw)?;
                    if last < self.nexttid {
                        continue;
                    }
                    if first >= self.endtid {
                        step = Some(PageStep::PastEnd);
                        break;
                    }
                    step = Some(match Item::decode(raw)? {
                        Item::Compressed(container) => PageStep::Inflate(container),
                        Item::Uncompressed(item) => PageStep::Found(item),
                    });
                    break;
                }
                match step {
                    Some(step) => step,
                    None => {
                        if opaque.next == blk {
                            return Err(ZedError::corrupt_at(blk, "right link points to itself"));
                        }
                        PageStep::WalkRight(opaque.next)
                    }
                }
            };

            // the page lock is released here; everything below works on
            // scan-owned copies
            match step {
                PageStep::Found(item) => return Ok(Some(item)),
                PageStep::Inflate(container) => {
                    self.decompressor = Some(Decompressor::new(&container)?);
                    continue;
                }
                PageStep::PastEnd => {
                    self.finish();
                    return Ok(None);
                }
                PageStep::WalkRight(next) => {
                    if next == INVALID_BLOCK || self.nexttid >= self.endtid {
                        self.finish();
                        return Ok(None);
                    }
                    let pin = self.lastbuf.take().expect("checked above");
                    self.lastbuf = Some(self.rel.pager.release_and_read(pin, next)?);
                }
            }
        }
    }
}
