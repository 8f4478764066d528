//! Internal pages: downlink maintenance, page split and root growth.
//!
//! An internal page's body is a packed array of `{tid:8, child:4}`
//! entries ordered by TID; the first entry's TID equals the page's lokey,
//! and the child covering key `k` is the last entry with `tid <= k`.

use tracing::debug;

use crate::error::{Result, ZedError};
use crate::primitives::pager::ExclusivePageGuard;
use crate::storage::meta;
use crate::storage::page;
use crate::storage::{btree, btree::Rel};
use crate::types::{BlockNumber, Tid, INVALID_BLOCK, META_BLOCK, PAGE_HDR_LEN, PAGE_SIZE};

/// Encoded size of one internal entry.
pub const INTERNAL_ENTRY_LEN: usize = 12;

pub fn entry_count(page: &[u8]) -> usize {
    (page::lower(page) - PAGE_HDR_LEN) / INTERNAL_ENTRY_LEN
}

pub fn entry(page: &[u8], idx: usize) -> (Tid, BlockNumber) {
    let off = PAGE_HDR_LEN + idx * INTERNAL_ENTRY_LEN;
    let tid = Tid(u64::from_be_bytes(page[off..off + 8].try_into().unwrap()));
    let child = u32::from_be_bytes(page[off + 8..off + 12].try_into().unwrap());
    (tid, child)
}

fn write_entry(page: &mut [u8], idx: usize, tid: Tid, child: BlockNumber) {
    let off = PAGE_HDR_LEN + idx * INTERNAL_ENTRY_LEN;
    page[off..off + 8].copy_from_slice(&tid.0.to_be_bytes());
    page[off + 8..off + 12].copy_from_slice(&child.to_be_bytes());
}

pub fn is_full(page: &[u8]) -> bool {
    page::body_free(page) < INTERNAL_ENTRY_LEN
}

/// Index of the last entry with `tid <= key`; `None` when the key sorts
/// before every entry (which a well-formed descent never produces).
pub fn search(page: &[u8], key: Tid) -> Option<usize> {
    let n = entry_count(page);
    let mut low = 0;
    let mut high = n;
    while high > low {
        let mid = low + (high - low) / 2;
        if key >= entry(page, mid).0 {
            low = mid + 1;
        } else {
            high = mid;
        }
    }
    low.checked_sub(1)
}

fn append_entry(page: &mut [u8], tid: Tid, child: BlockNumber) -> Result<()> {
    let mut buf = [0u8; INTERNAL_ENTRY_LEN];
    buf[0..8].copy_from_slice(&tid.0.to_be_bytes());
    buf[8..12].copy_from_slice(&child.to_be_bytes());
    page::body_append(page, &buf)?;
    Ok(())
}

fn insert_entry_at(page: &mut [u8], idx: usize, tid: Tid, child: BlockNumber) -> Result<()> {
    if is_full(page) {
        return Err(ZedError::Invalid("internal page is full"));
    }
    let n = entry_count(page);
    let start = PAGE_HDR_LEN + idx * INTERNAL_ENTRY_LEN;
    let end = PAGE_HDR_LEN + n * INTERNAL_ENTRY_LEN;
    page.copy_within(start..end, start + INTERNAL_ENTRY_LEN);
    write_entry(page, idx, tid, child);
    page::set_lower(page, end + INTERNAL_ENTRY_LEN);
    Ok(())
}

/// After a split, installs the downlink for the new right sibling into
/// the parent, growing a new root or splitting the parent as needed.
///
/// On entry `left` is exclusively locked; every path releases it before
/// returning. A crash (or any failure) between the split and this insert
/// leaves `left` flagged follow-right, and descents recover by chasing
/// the right link.
pub(crate) fn insert_downlink(
    rel: &Rel,
    attno: u16,
    mut left: ExclusivePageGuard,
    right_lokey: Tid,
    right_blk: BlockNumber,
) -> Result<()> {
    let left_blk = left.block();
    let left_opaque = page::tree_opaque(&left)?;
    let (root, _) = meta::get_root(&rel.pager, attno, true)?;
    if left_opaque.is_root() || root == left_blk {
        return new_root(
            rel,
            attno,
            left_opaque.level + 1,
            left_opaque.lokey,
            right_lokey,
            right_blk,
            left,
        );
    }

    // Re-find the parent by descending from the root. Inefficient, but a
    // remembered descent path would go stale across concurrent splits
    // anyway; the re-descent handles those the same way as any other.
    let mut parent = btree::descend(rel, attno, left_opaque.lokey, left_opaque.level + 1, true)?
        .ok_or_else(|| ZedError::corrupt_at(left_blk, "no parent level above split page"))?;
    let parent_blk = parent.block();
    let idx = search(&parent, right_lokey)
        .ok_or_else(|| ZedError::corrupt_at(parent_blk, "downlink key below parent range"))?;
    let (found_tid, found_child) = entry(&parent, idx);
    if found_tid != left_opaque.lokey || found_child != left_blk {
        return Err(ZedError::corrupt_at(
            parent_blk,
            "parent entry does not match the split page",
        ));
    }

    if is_full(&parent) {
        return split(rel, attno, parent, left, idx + 1, right_lokey, right_blk);
    }

    insert_entry_at(&mut parent, idx + 1, right_lokey, right_blk)?;
    parent.mark_dirty();
    clear_follow_right(&mut left)?;
    left.mark_dirty();
    Ok(())
}

fn clear_follow_right(guard: &mut ExclusivePageGuard) -> Result<()> {
    let mut opaque = page::tree_opaque(guard)?;
    opaque.flags &= !page::TREE_FLAG_FOLLOW_RIGHT;
    page::write_tree_opaque(guard, &opaque);
    Ok(())
}

/// Grows a new root holding downlinks to `left` (covering from its lokey)
/// and the new right page. The metapage root directory is updated while
/// both the metapage and the old root are held exclusively.
fn new_root(
    rel: &Rel,
    attno: u16,
    level: u16,
    left_lokey: Tid,
    right_lokey: Tid,
    right_blk: BlockNumber,
    mut left: ExclusivePageGuard,
) -> Result<()> {
    debug_assert!(left_lokey < right_lokey);
    let meta_pin = rel.pager.pin(META_BLOCK)?;
    let mut meta_guard = meta_pin.write();

    let (root_pin, root_blk) = rel.pager.new_page()?;
    let mut root_guard = root_pin.write();
    page::init_tree_page(
        &mut root_guard,
        &page::TreeOpaque {
            attno,
            next: INVALID_BLOCK,
            lokey: Tid::MIN,
            hikey: Tid::MAX_PLUS_ONE,
            level,
            flags: page::TREE_FLAG_ROOT,
        },
    );
    append_entry(&mut root_guard, left_lokey, left.block())?;
    append_entry(&mut root_guard, right_lokey, right_blk)?;
    root_guard.mark_dirty();

    let mut left_opaque = page::tree_opaque(&left)?;
    left_opaque.flags &= !(page::TREE_FLAG_ROOT | page::TREE_FLAG_FOLLOW_RIGHT);
    page::write_tree_opaque(&mut left, &left_opaque);
    left.mark_dirty();

    meta::update_root_locked(&mut meta_guard, attno, root_blk)?;
    meta_guard.mark_dirty();
    debug!(attno, level, root = root_blk, "grew a new tree root");
    Ok(())
}

/// Splits a full internal page 90/10 and inserts `(new_key, new_child)`
/// at `new_off` on whichever half covers it. `child` is the lower-level
/// page whose downlink is being installed; its follow-right flag clears
/// here, the moment the downlink becomes reachable.
fn split(
    rel: &Rel,
    attno: u16,
    mut parent: ExclusivePageGuard,
    mut child: ExclusivePageGuard,
    new_off: usize,
    new_key: Tid,
    new_child: BlockNumber,
) -> Result<()> {
    let orig_opaque = page::tree_opaque(&parent)?;
    debug_assert!(orig_opaque.level > 0);
    debug_assert!(!orig_opaque.follow_right());

    let (right_pin, right_blk) = rel.pager.new_page()?;
    let mut right_guard = right_pin.write();

    let n = entry_count(&parent);
    let split_point = (n * 9 / 10).clamp(1, n - 1);
    let split_tid = entry(&parent, split_point).0;
    let new_on_left = new_key < split_tid;

    let mut left_image = vec![0u8; PAGE_SIZE];
    page::init_tree_page(
        &mut left_image,
        &page::TreeOpaque {
            attno,
            next: right_blk,
            lokey: orig_opaque.lokey,
            hikey: split_tid,
            level: orig_opaque.level,
            flags: orig_opaque.flags | page::TREE_FLAG_FOLLOW_RIGHT,
        },
    );
    page::init_tree_page(
        &mut right_guard,
        &page::TreeOpaque {
            attno,
            next: orig_opaque.next,
            lokey: split_tid,
            hikey: orig_opaque.hikey,
            level: orig_opaque.level,
            flags: 0,
        },
    );

    for i in 0..n {
        if i == new_off {
            let target: &mut [u8] = if new_on_left {
                &mut left_image
            } else {
                &mut right_guard
            };
            append_entry(target, new_key, new_child)?;
        }
        let (tid, blk) = entry(&parent, i);
        let target: &mut [u8] = if i < split_point {
            &mut left_image
        } else {
            &mut right_guard
        };
        append_entry(target, tid, blk)?;
    }
    if new_off >= n {
        debug_assert!(!new_on_left);
        append_entry(&mut right_guard, new_key, new_child)?;
    }
    debug_assert_eq!(
        entry_count(&left_image) + entry_count(&right_guard),
        n + 1
    );

    parent.copy_from_slice(&left_image);
    parent.mark_dirty();
    right_guard.mark_dirty();

    clear_follow_right(&mut child)?;
    child.mark_dirty();
    drop(child);
    drop(right_guard);

    debug!(attno, left = parent.block(), right = right_blk, "split internal page");
    insert_downlink(rel, attno, parent, split_tid, right_blk)
}
