//! Leaf rewrite: replace-and-insert, recompression, multi-page split.
//!
//! Leaf mutations never edit items in place. They rebuild the page's
//! logical item list (replacing or eliding the target, merging in new
//! items, decompressing any container that stands in the way) and hand
//! the list to the recompressor, which packs it onto as many page images
//! as it takes and wires the images into the tree.

use std::collections::VecDeque;

use smallvec::SmallVec;

use crate::error::{Result, ZedError};
use crate::primitives::pager::ExclusivePageGuard;
use crate::storage::btree::{internal, Rel};
use crate::storage::compress::{Compressor, Decompressor};
use crate::storage::item::{AttrDesc, Item, UncompressedItem};
use crate::storage::page;
use crate::types::{Tid, UndoPtr, INVALID_BLOCK, PAGE_SIZE};

/// At most two containers may need decompressing in one rewrite: the one
/// covering the replaced item and the one covering the first new TID.
const MAX_REWRITE_DECOMPRESSIONS: usize = 2;

struct RewriteList<'a> {
    rel: &'a Rel,
    desc: &'a AttrDesc,
    items: Vec<Item>,
    pending_new: VecDeque<UncompressedItem>,
    old_tid: Option<Tid>,
    replacement: Option<UncompressedItem>,
    found_old: bool,
    oldest_live: Option<UndoPtr>,
}

impl<'a> RewriteList<'a> {
    /// Sampled lazily; most rewrites never meet a dead item.
    fn oldest_live(&mut self) -> Result<UndoPtr> {
        if let Some(ptr) = self.oldest_live {
            return Ok(ptr);
        }
        let ptr = self.rel.undo.oldest_live()?;
        self.oldest_live = Some(ptr);
        Ok(ptr)
    }

    /// Merges pending new items that sort before `tid` into the list.
    fn merge_new_before(&mut self, tid: Tid) -> Result<()> {
        while let Some(front) = self.pending_new.front() {
            if front.tid > tid {
                break;
            }
            if front.last_tid() >= tid {
                return Err(ZedError::Corruption(
                    "new item overlaps an existing item".into(),
                ));
            }
            let item = self.pending_new.pop_front().expect("front checked above");
            self.items.push(Item::Uncompressed(item));
        }
        Ok(())
    }

    /// Feeds one existing uncompressed item through the rewrite rules.
    fn push_existing(&mut self, item: UncompressedItem) -> Result<()> {
        self.merge_new_before(item.tid)?;
        if let Some(old_tid) = self.old_tid {
            if !self.found_old && item.covers(old_tid) {
                self.found_old = true;
                let idx = (old_tid.0 - item.tid.0) as usize;
                let n = item.nelements as usize;
                if idx > 0 {
                    self.items
                        .push(Item::Uncompressed(item.slice_elements(self.desc, 0, idx)?));
                }
                if let Some(replacement) = self.replacement.take() {
                    self.items.push(Item::Uncompressed(replacement));
                }
                if idx + 1 < n {
                    self.items.push(Item::Uncompressed(
                        item.slice_elements(self.desc, idx + 1, n - idx - 1)?,
                    ));
                }
                return Ok(());
            }
        }
        if item.is_dead() && item.undo < self.oldest_live()? {
            // the tombstone has outlived every chain that could resurrect
            // it; drop it and let the TID be reused
            return Ok(());
        }
        self.items.push(Item::Uncompressed(item));
        Ok(())
    }

    fn finish(mut self) -> Result<Vec<Item>> {
        if self.old_tid.is_some() && !self.found_old {
            return Err(ZedError::Corruption(
                "could not find the old item to replace".into(),
            ));
        }
        while let Some(item) = self.pending_new.pop_front() {
            self.items.push(Item::Uncompressed(item));
        }
        Ok(self.items)
    }
}

/// Rebuilds `leaf`'s item list, replacing the item at `old_tid` with
/// `replacement` (or eliding it when `None`) and merging `new_items` in
/// TID order, then rewrites the page through the recompressor. Consumes
/// the leaf lock; on return every page lock taken here has been dropped.
pub(crate) fn replace_item(
    rel: &Rel,
    attno: u16,
    desc: &AttrDesc,
    leaf: ExclusivePageGuard,
    old_tid: Option<Tid>,
    replacement: Option<UncompressedItem>,
    new_items: Vec<UncompressedItem>,
) -> Result<()> {
    debug_assert!(new_items.windows(2).all(|w| w[0].last_tid() < w[1].tid));
    let blk = leaf.block();
    let mut list = RewriteList {
        rel,
        desc,
        items: Vec::new(),
        pending_new: new_items.into(),
        old_tid,
        replacement,
        found_old: false,
        oldest_live: None,
    };
    let mut decompressions = 0usize;

    for off in 1..=page::max_offset(&leaf) {
        let raw = page::item(&leaf, off)?;
        match Item::decode(raw)? {
            Item::Compressed(container) => {
                let covers_old = list
                    .old_tid
                    .map_or(false, |t| container.tid <= t && t <= container.lasttid);
                let covers_new = list.pending_new.front().map_or(false, |front| {
                    front.tid <= container.lasttid && front.last_tid() >= container.tid
                });
                if covers_old || covers_new {
                    if decompressions == MAX_REWRITE_DECOMPRESSIONS {
                        return Err(ZedError::corrupt_at(
                            blk,
                            "rewrite would open a third compressed container",
                        ));
                    }
                    decompressions += 1;
                    let mut decompressor = Decompressor::new(&container)?;
                    while let Some(item) = decompressor.next_item()? {
                        list.push_existing(item)?;
                    }
                } else {
                    list.merge_new_before(container.tid)?;
                    list.items.push(Item::Compressed(container));
                }
            }
            Item::Uncompressed(item) => list.push_existing(item)?,
        }
    }

    let items = list.finish()?;
    recompress_replace(rel, attno, leaf, items)
}

struct PackContext {
    /// Almost every rewrite fits back onto one page; splits past two
    /// images are rare enough to spill.
    images: SmallVec<[Vec<u8>; 2]>,
    attno: u16,
    final_hikey: Tid,
    first_flags: u16,
}

impl PackContext {
    fn current(&mut self) -> &mut Vec<u8> {
        self.images.last_mut().expect("at least one image")
    }

    /// Starts a new page image; the previous image's hikey becomes the
    /// incoming item's first TID, fixing the split boundary exactly.
    fn new_image(&mut self, next_lokey: Tid) {
        if let Some(prev) = self.images.last_mut() {
            let mut opaque = page::tree_opaque(prev).expect("image built here");
            opaque.hikey = next_lokey;
            page::write_tree_opaque(prev, &opaque);
        }
        let flags = if self.images.is_empty() {
            self.first_flags
        } else {
            0
        };
        let mut image = vec![0u8; PAGE_SIZE];
        page::init_tree_page(
            &mut image,
            &page::TreeOpaque {
                attno: self.attno,
                next: INVALID_BLOCK,
                lokey: next_lokey,
                hikey: self.final_hikey,
                level: 0,
                flags,
            },
        );
        self.images.push(image);
    }

    fn add(&mut self, item: &Item) -> Result<()> {
        let encoded = item.encode();
        if page::free_space(self.current()) < encoded.len() {
            self.new_image(item.first_tid());
        }
        page::add_item(self.current(), &encoded)?;
        Ok(())
    }

    fn flush_compressor(&mut self, compressor: &mut Option<Compressor>) -> Result<()> {
        let Some(mut active) = compressor.take() else {
            return Ok(());
        };
        if active.is_empty() {
            return Ok(());
        }
        match active.finish() {
            Some(container) => self.add(&Item::Compressed(container))?,
            None => {
                // did not shrink; store the batch as it was
                for item in active.into_items() {
                    self.add(&Item::Uncompressed(item))?;
                }
            }
        }
        Ok(())
    }
}

/// Packs `items` onto page images (compressing uncompressed runs), then
/// writes the images out: the first over the original leaf, the rest onto
/// freshly allocated pages chained with follow-right until their
/// downlinks are installed left to right.
fn recompress_replace(
    rel: &Rel,
    attno: u16,
    leaf: ExclusivePageGuard,
    items: Vec<Item>,
) -> Result<()> {
    let orig_opaque = page::tree_opaque(&leaf)?;
    let mut ctx = PackContext {
        images: SmallVec::new(),
        attno,
        final_hikey: orig_opaque.hikey,
        first_flags: orig_opaque.flags & page::TREE_FLAG_ROOT,
    };
    ctx.new_image(orig_opaque.lokey);
    let mut compressor: Option<Compressor> = None;

    for item in &items {
        match item {
            Item::Compressed(_) => {
                // pre-compressed content passes through untouched
                ctx.flush_compressor(&mut compressor)?;
                ctx.add(item)?;
            }
            Item::Uncompressed(uncompressed) => {
                if compressor.is_none() {
                    compressor = Some(Compressor::begin(page::free_space(ctx.current())));
                }
                let added = compressor
                    .as_mut()
                    .expect("installed above")
                    .add(uncompressed);
                if !added {
                    let had_items = !compressor.as_ref().expect("installed above").is_empty();
                    if had_items {
                        ctx.flush_compressor(&mut compressor)?;
                        let mut retry = Compressor::begin(page::free_space(ctx.current()));
                        if retry.add(uncompressed) {
                            compressor = Some(retry);
                        } else {
                            ctx.add(&Item::Uncompressed(uncompressed.clone()))?;
                        }
                    } else {
                        compressor = None;
                        ctx.add(&Item::Uncompressed(uncompressed.clone()))?;
                    }
                }
            }
        }
    }
    ctx.flush_compressor(&mut compressor)?;

    let images = ctx.images;
    let k = images.len();

    // Allocate buffers for the extra images up front, so running out of
    // space cannot happen once pages start changing.
    let mut guards: Vec<ExclusivePageGuard> = Vec::with_capacity(k);
    guards.push(leaf);
    for _ in 1..k {
        let (pin, _) = rel.pager.new_page()?;
        guards.push(pin.write());
    }

    for (i, image) in images.iter().enumerate() {
        let next_blk = if i + 1 < k {
            Some(guards[i + 1].block())
        } else {
            None
        };
        let guard = &mut guards[i];
        guard.copy_from_slice(image);
        let mut opaque = page::tree_opaque(guard)?;
        match next_blk {
            Some(blk) => {
                opaque.next = blk;
                opaque.flags |= page::TREE_FLAG_FOLLOW_RIGHT;
            }
            None => opaque.next = orig_opaque.next,
        }
        page::write_tree_opaque(guard, &opaque);
        guard.mark_dirty();
    }

    // Install downlinks for the new pages, left to right; each insert
    // releases its left page.
    let mut guards = guards.into_iter();
    let mut left = guards.next().expect("first image exists");
    for right in guards {
        let right_lokey = page::tree_opaque(&left)?.hikey;
        let right_blk = right.block();
        internal::insert_downlink(rel, attno, left, right_lokey, right_blk)?;
        left = right;
    }
    drop(left);
    Ok(())
}
