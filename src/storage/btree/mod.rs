//! Per-attribute B+ tree keyed by TID.
//!
//! One tree per attribute, all sharing a file. Functions here deal with a
//! single tree; the table layer ties the per-attribute scans together.
//!
//! Locking order: child before parent, left before right. Descent drops
//! the parent lock before taking the child's; the hikey / follow-right
//! protocol recovers from any split that slips into that window, so
//! descent never deadlocks against a splitter walking the other way.

pub mod internal;
pub mod leaf;
pub mod ops;
pub mod scan;


use std::sync::Arc;

use crate::error::{Result, ZedError};
use crate::primitives::pager::{ExclusivePageGuard, Pager};
use crate::storage::meta;
use crate::storage::page;
use crate::storage::txn::TxManager;
use crate::storage::undo::UndoLog;
use crate::types::{BlockNumber, Tid, INVALID_BLOCK};

/// Everything a tree operation needs to reach the rest of the engine.
pub struct Rel {
    pub pager: Arc<Pager>,
    pub txm: Arc<TxManager>,
    pub undo: Arc<UndoLog>,
}

/// Descends to the page at `target_level` (0 = leaf) whose key range
/// contains `key`, returning it exclusively locked. `None` means the
/// attribute has no tree yet (and `create_root` was false).
///
/// Two recovery behaviors on `key >= hikey`:
///
/// * the page advertises follow-right: an in-progress split moved our
///   keys to the right sibling before the parent downlink landed, so
///   chase the right link;
/// * no follow-right: the downlink that sent us here is stale (the page
///   was emptied and its range taken over), so remember this block as a
///   dead end and restart from the root. Reaching the same dead end
///   twice is corruption.
pub(crate) fn descend(
    rel: &Rel,
    attno: u16,
    key: Tid,
    target_level: u16,
    create_root: bool,
) -> Result<Option<ExclusivePageGuard>> {
    let (root, _) = meta::get_root(&rel.pager, attno, create_root)?;
    if root == INVALID_BLOCK {
        return Ok(None);
    }
    let mut next = root;
    let mut expected_level: Option<u16> = None;
    let mut dead_end: Option<BlockNumber> = None;
    loop {
        let pin = rel.pager.pin(next)?;
        let guard = pin.write();
        let blk = guard.block();
        let opaque =
            page::tree_opaque(&guard).map_err(|_| ZedError::corrupt_at(blk, "not a tree page"))?;
        if opaque.attno != attno {
            return Err(ZedError::corrupt_at(blk, "page belongs to another attribute"));
        }
        match expected_level {
            Some(level) if opaque.level != level => {
                return Err(ZedError::corrupt_at(
                    blk,
                    "unexpected level encountered while descending",
                ));
            }
            None if opaque.level < target_level => {
                return Err(ZedError::corrupt_at(blk, "tree is shallower than requested"));
            }
            _ => {}
        }
        if key >= opaque.hikey {
            if opaque.follow_right() {
                if opaque.next == INVALID_BLOCK {
                    return Err(ZedError::corrupt_at(blk, "fell off the end of the tree"));
                }
                if opaque.next == blk {
                    return Err(ZedError::corrupt_at(blk, "right link points to itself"));
                }
                next = opaque.next;
                expected_level = Some(opaque.level);
                continue;
            }
            if dead_end == Some(blk) {
                return Err(ZedError::corrupt_at(blk, "descent revisited a dead end"));
            }
            dead_end = Some(blk);
            drop(guard);
            let (root, _) = meta::get_root(&rel.pager, attno, false)?;
            if root == INVALID_BLOCK {
                return Err(ZedError::corrupt_at(blk, "tree root vanished during descent"));
            }
            next = root;
            expected_level = None;
            continue;
        }
        if opaque.level == target_level {
            return Ok(Some(guard));
        }
        let idx = internal::search(&guard, key).ok_or_else(|| {
            ZedError::corrupt_at(blk, "no internal entry covers the search key")
        })?;
        let (_, child) = internal::entry(&guard, idx);
        next = child;
        expected_level = Some(opaque.level - 1);
    }
}
