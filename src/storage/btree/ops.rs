//! Public tree operations: scans, inserts, deletes, updates, tuple locks
//! and the vacuum entry points.
//!
//! Every mutation follows one shape: descend to the leaf with an
//! exclusive lock, locate the target item, consult visibility, append an
//! UNDO record, and rewrite the leaf. Conflicts come back as structured
//! outcomes; the tree itself never waits for another transaction.

use tracing::warn;

use crate::error::{Result, ZedError};
use crate::primitives::pager::ExclusivePageGuard;
use crate::storage::btree::{descend, leaf, scan::TreeScan, Rel};
use crate::storage::compress::Decompressor;
use crate::storage::item::{
    self, AttrDesc, Item, UncompressedItem, ITEM_DELETED, ITEM_UPDATED,
};
use crate::storage::meta::{self, META_ATTNO};
use crate::storage::page;
use crate::storage::txn::{LockMode, Snapshot};
use crate::storage::undo::{UndoPayload, UndoRec};
use crate::storage::visibility::{satisfies_update, UpdateOutcome};
use crate::types::{Cid, Tid, UndoPtr, Xid};

/// Starts a scan of `attno` over `[start, end)` under `snapshot`.
pub(crate) fn begin_scan<'a>(
    rel: &'a Rel,
    attno: u16,
    start: Tid,
    end: Tid,
    snapshot: Snapshot,
) -> Result<TreeScan<'a>> {
    let (_, desc) = meta::get_root(&rel.pager, attno, false)?;
    TreeScan::begin(rel, attno, desc, start, end, snapshot)
}

/// One past the last TID in the tree (or the rightmost page's lokey when
/// the tree is empty): the next TID an insert would be assigned.
pub(crate) fn get_last_tid(rel: &Rel, attno: u16) -> Result<Tid> {
    let guard = descend(rel, attno, Tid::MAX, 0, true)?
        .expect("descend allocates the root when asked to");
    let maxoff = page::max_offset(&guard);
    if maxoff == 0 {
        return Ok(page::tree_opaque(&guard)?.lokey);
    }
    let raw = page::item(&guard, maxoff)?;
    let (_, last) = item::peek_tid_range(raw)?;
    Ok(last.next())
}

/// Inserts `datums` into `attno`'s tree.
///
/// When `tids[0]` is invalid, fresh TIDs are assigned one past the
/// rightmost item and written back into `tids` (insert the
/// meta-attribute first and hand its TIDs to the data attributes).
/// When `undo_ptr` is invalid and this is the meta-attribute, one insert
/// record covering the whole TID range is appended and `undo_ptr` set to
/// it; data attributes keep the invalid pointer, as their items carry no
/// visibility.
pub(crate) fn multi_insert(
    rel: &Rel,
    attno: u16,
    datums: &[&[u8]],
    isnulls: &[bool],
    tids: &mut [Tid],
    xid: Xid,
    cid: Cid,
    undo_ptr: &mut UndoPtr,
) -> Result<()> {
    let n = tids.len();
    if n == 0 || datums.len() != n || isnulls.len() != n {
        return Err(ZedError::Invalid("mismatched insert array lengths"));
    }
    let (_, desc) = meta::get_root(&rel.pager, attno, true)?;
    let assign_tids = !tids[0].is_valid();
    let mut pos = 0;
    while pos < n {
        let target_key = if assign_tids { Tid::MAX } else { tids[pos] };
        let guard = descend(rel, attno, target_key, 0, true)?
            .expect("descend allocates the root when asked to");
        let opaque = page::tree_opaque(&guard)?;
        let maxoff = page::max_offset(&guard);
        let page_lasttid = if maxoff == 0 {
            None
        } else {
            Some(item::peek_tid_range(page::item(&guard, maxoff)?)?.1)
        };

        if pos == 0 {
            if assign_tids {
                let mut tid = match page_lasttid {
                    Some(last) => last.next(),
                    None => opaque.lokey,
                };
                for slot in tids.iter_mut() {
                    *slot = tid;
                    tid = tid.next();
                }
            }
            if !undo_ptr.is_valid() && attno == META_ATTNO {
                *undo_ptr = rel.undo.insert(&UndoRec {
                    xid,
                    cid,
                    tid: tids[0],
                    payload: UndoPayload::Insert {
                        endtid: tids[n - 1],
                    },
                })?;
            }
        }

        // only the run of TIDs this leaf covers goes in on this pass
        let mut chunk = pos;
        while chunk < n && tids[chunk] < opaque.hikey {
            chunk += 1;
        }
        debug_assert!(chunk > pos, "descend put us on a leaf not covering the key");
        let items = item::create_items(
            &desc,
            &tids[pos..chunk],
            &datums[pos..chunk],
            &isnulls[pos..chunk],
            *undo_ptr,
        )?;
        insert_items_on_leaf(rel, attno, &desc, guard, page_lasttid, items)?;
        pos = chunk;
    }
    Ok(())
}

/// Appends what fits directly; anything left (or anything that would
/// land out of order) goes through the conservative full-rewrite path.
fn insert_items_on_leaf(
    rel: &Rel,
    attno: u16,
    desc: &AttrDesc,
    mut guard: ExclusivePageGuard,
    mut page_lasttid: Option<Tid>,
    items: Vec<UncompressedItem>,
) -> Result<()> {
    let mut idx = 0;
    while idx < items.len() {
        let item = &items[idx];
        let beyond_last = match page_lasttid {
            Some(last) => item.tid > last,
            None => false,
        };
        if !beyond_last || page::free_space(&guard) < item.encoded_len() {
            break;
        }
        let encoded = Item::Uncompressed(item.clone()).encode();
        page::add_item(&mut guard, &encoded)?;
        guard.mark_dirty();
        page_lasttid = Some(item.last_tid());
        idx += 1;
    }
    if idx < items.len() {
        leaf::replace_item(rel, attno, desc, guard, None, None, items[idx..].to_vec())?;
    }
    Ok(())
}

/// Finds the item covering `tid` with the leaf exclusively locked,
/// inflating a covering container if needed.
fn fetch_item_for_update(
    rel: &Rel,
    attno: u16,
    tid: Tid,
) -> Result<Option<(ExclusivePageGuard, UncompressedItem)>> {
    let Some(guard) = descend(rel, attno, tid, 0, false)? else {
        return Ok(None);
    };
    for off in 1..=page::max_offset(&guard) {
        let raw = page::item(&guard, off)?;
        let (first, last) = item::peek_tid_range(raw)?;
        if last < tid {
            continue;
        }
        if first > tid {
            break;
        }
        match Item::decode(raw)? {
            Item::Compressed(container) => {
                let mut decompressor = Decompressor::new(&container)?;
                while let Some(inner) = decompressor.next_item()? {
                    if inner.covers(tid) {
                        return Ok(Some((guard, inner)));
                    }
                    if inner.tid > tid {
                        break;
                    }
                }
                break;
            }
            Item::Uncompressed(item) => {
                if item.covers(tid) {
                    return Ok(Some((guard, item)));
                }
                break;
            }
        }
    }
    Ok(None)
}

/// Deletes the tuple at `tid`.
pub(crate) fn delete(
    rel: &Rel,
    attno: u16,
    tid: Tid,
    xid: Xid,
    cid: Cid,
    snapshot: &Snapshot,
) -> Result<UpdateOutcome> {
    let desc = meta::attr_desc(&rel.pager, attno)?;
    let Some((guard, item)) = fetch_item_for_update(rel, attno, tid)? else {
        return Ok(UpdateOutcome::Missing);
    };
    let recent_oldest = rel.undo.oldest_live()?;
    let (outcome, keep_old_undo) = satisfies_update(
        &rel.undo,
        &rel.txm,
        snapshot,
        recent_oldest,
        &item,
        LockMode::Exclusive,
    )?;
    if !outcome.is_ok() {
        return Ok(outcome);
    }
    let undo_ptr = rel.undo.insert(&UndoRec {
        xid,
        cid,
        tid,
        payload: UndoPayload::Delete {
            prev: if keep_old_undo {
                item.undo
            } else {
                UndoPtr::INVALID
            },
        },
    })?;
    let mut replacement = item.extract_single(&desc, tid)?;
    replacement.flags |= ITEM_DELETED;
    replacement.undo = undo_ptr;
    leaf::replace_item(rel, attno, &desc, guard, Some(tid), Some(replacement), Vec::new())?;
    Ok(UpdateOutcome::Ok)
}

/// Updates the tuple at `otid` to a new version, which gets a fresh TID.
/// On success the old item is stamped with an update record pointing at
/// the new TID, chaining the two versions together.
pub(crate) fn update(
    rel: &Rel,
    attno: u16,
    otid: Tid,
    new_datum: &[u8],
    new_isnull: bool,
    xid: Xid,
    cid: Cid,
    key_update: bool,
    snapshot: &Snapshot,
) -> Result<(UpdateOutcome, Tid)> {
    let lock_mode = if key_update {
        LockMode::Exclusive
    } else {
        LockMode::NoKeyExclusive
    };

    // check the old version first, so an invisible or locked tuple fails
    // before the new version exists anywhere
    {
        let Some((_guard, item)) = fetch_item_for_update(rel, attno, otid)? else {
            return Ok((UpdateOutcome::Missing, Tid::INVALID));
        };
        let recent_oldest = rel.undo.oldest_live()?;
        let (outcome, _) = satisfies_update(
            &rel.undo,
            &rel.txm,
            snapshot,
            recent_oldest,
            &item,
            lock_mode,
        )?;
        if !outcome.is_ok() {
            return Ok((outcome, Tid::INVALID));
        }
    }

    // insert the new version; the meta-attribute mints its insert record
    let mut new_tids = [Tid::INVALID];
    let mut new_undo = UndoPtr::INVALID;
    multi_insert(
        rel,
        attno,
        &[new_datum],
        &[new_isnull],
        &mut new_tids,
        xid,
        cid,
        &mut new_undo,
    )?;
    let new_tid = new_tids[0];

    // stamp the old version; a conflict here means someone slipped in
    // between our check and now
    let desc = meta::attr_desc(&rel.pager, attno)?;
    let Some((guard, item)) = fetch_item_for_update(rel, attno, otid)? else {
        return Err(ZedError::Corruption(
            "updated item vanished mid-operation".into(),
        ));
    };
    let recent_oldest = rel.undo.oldest_live()?;
    let (outcome, keep_old_undo) = satisfies_update(
        &rel.undo,
        &rel.txm,
        snapshot,
        recent_oldest,
        &item,
        lock_mode,
    )?;
    if !outcome.is_ok() {
        return Err(ZedError::Invalid("tuple concurrently updated"));
    }
    let undo_ptr = rel.undo.insert(&UndoRec {
        xid,
        cid,
        tid: otid,
        payload: UndoPayload::Update {
            prev: if keep_old_undo {
                item.undo
            } else {
                UndoPtr::INVALID
            },
            newtid: new_tid,
            key_update,
        },
    })?;
    let mut replacement = item.extract_single(&desc, otid)?;
    replacement.flags |= ITEM_UPDATED;
    replacement.undo = undo_ptr;
    leaf::replace_item(
        rel,
        attno,
        &desc,
        guard,
        Some(otid),
        Some(replacement),
        Vec::new(),
    )?;
    Ok((UpdateOutcome::Ok, new_tid))
}

/// Takes a tuple lock on `tid` by chaining a lock record onto its UNDO
/// chain and restamping the item.
pub(crate) fn lock_item(
    rel: &Rel,
    attno: u16,
    tid: Tid,
    xid: Xid,
    cid: Cid,
    mode: LockMode,
    snapshot: &Snapshot,
) -> Result<UpdateOutcome> {
    let desc = meta::attr_desc(&rel.pager, attno)?;
    let Some((guard, item)) = fetch_item_for_update(rel, attno, tid)? else {
        return Ok(UpdateOutcome::Missing);
    };
    let recent_oldest = rel.undo.oldest_live()?;
    let (outcome, keep_old_undo) =
        satisfies_update(&rel.undo, &rel.txm, snapshot, recent_oldest, &item, mode)?;
    if !outcome.is_ok() {
        return Ok(outcome);
    }
    if item.flags & (ITEM_DELETED | ITEM_UPDATED) != 0 {
        return Err(ZedError::Invalid("cannot lock a deleted tuple"));
    }
    let undo_ptr = rel.undo.insert(&UndoRec {
        xid,
        cid,
        tid,
        payload: UndoPayload::TupleLock {
            prev: if keep_old_undo {
                item.undo
            } else {
                UndoPtr::INVALID
            },
            mode,
        },
    })?;
    let mut replacement = item.extract_single(&desc, tid)?;
    replacement.undo = undo_ptr;
    leaf::replace_item(rel, attno, &desc, guard, Some(tid), Some(replacement), Vec::new())?;
    Ok(UpdateOutcome::Ok)
}

/// Replaces the item at `tid` with a tombstone that keeps the TID
/// reserved until the UNDO horizon passes `undo_ptr`. Vacuum calls this
/// for TIDs no index references anymore; a missing item only warrants a
/// diagnostic.
pub(crate) fn mark_item_dead(rel: &Rel, attno: u16, tid: Tid, undo_ptr: UndoPtr) -> Result<()> {
    let desc = meta::attr_desc(&rel.pager, attno)?;
    let Some((guard, item)) = fetch_item_for_update(rel, attno, tid)? else {
        warn!(attno, %tid, "no tuple to mark dead");
        return Ok(());
    };
    if item.is_dead() {
        return Ok(());
    }
    let tombstone = UncompressedItem::tombstone(tid, undo_ptr);
    leaf::replace_item(rel, attno, &desc, guard, Some(tid), Some(tombstone), Vec::new())
}

/// Vacuum rollback: if the item at `tid` still points at `undo_ptr`,
/// clear its deleted/updated stamp and detach it from the chain. Any
/// other pointer means the deletion was superseded, and this is a no-op.
pub(crate) fn undo_item_deletion(rel: &Rel, attno: u16, tid: Tid, undo_ptr: UndoPtr) -> Result<()> {
    let desc = meta::attr_desc(&rel.pager, attno)?;
    let Some((guard, item)) = fetch_item_for_update(rel, attno, tid)? else {
        warn!(attno, %tid, "no tuple to roll back");
        return Ok(());
    };
    if item.flags & (ITEM_DELETED | ITEM_UPDATED) == 0 || item.undo != undo_ptr {
        return Ok(());
    }
    let mut replacement = item.clone();
    replacement.flags &= !(ITEM_DELETED | ITEM_UPDATED);
    replacement.undo = UndoPtr::INVALID;
    leaf::replace_item(rel, attno, &desc, guard, Some(tid), Some(replacement), Vec::new())
}
