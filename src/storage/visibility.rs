//! MVCC visibility over UNDO chains.
//!
//! An item's UNDO pointer leads to the record of the transaction that
//! created (or deleted, or locked) it; older records for the same row
//! chain behind it. Visibility walks that chain under one of five
//! snapshot rule sets. Pointers older than the sampled oldest-live
//! horizon short-circuit: such a version is simply committed-and-stable,
//! visible unless the item says it was deleted or updated away.

use crate::error::{Result, ZedError};
use crate::storage::item::{UncompressedItem, ITEM_COMPRESSED, ITEM_DELETED, ITEM_UPDATED};
use crate::storage::txn::{lock_modes_compatible, LockMode, Snapshot, SnapshotKind, TxManager};
use crate::storage::undo::{UndoLog, UndoPayload, UndoRec};
use crate::types::{Cid, Tid, UndoPtr, Xid};

/// Structured conflict details handed back to the caller, who decides
/// whether to wait, retry or surface the failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConflictInfo {
    pub conflicting_tid: Tid,
    pub xmax: Xid,
    pub cmax: Cid,
}

/// Outcome of checking an item for update/delete/lock.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UpdateOutcome {
    Ok,
    Invisible,
    SelfModified(ConflictInfo),
    BeingModified(ConflictInfo),
    Updated(ConflictInfo),
    Deleted(ConflictInfo),
    /// No item with the requested TID exists.
    Missing,
}

impl UpdateOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, UpdateOutcome::Ok)
    }
}

fn is_deleted(item: &UncompressedItem) -> bool {
    item.flags & (ITEM_DELETED | ITEM_UPDATED) != 0
}

/// Fetch that treats a concurrently trimmed record like one behind the
/// horizon: the caller maps `None` to the short-circuit answer.
fn fetch(undo: &UndoLog, ptr: UndoPtr) -> Result<Option<UndoRec>> {
    undo.fetch(ptr)
}

/// Is `xid`'s work visible to an MVCC snapshot? The second flag reports
/// an aborted or crashed transaction, which the rewriter may elide.
fn xid_visible(txm: &TxManager, snapshot: &Snapshot, xid: Xid, cid: Cid) -> (bool, bool) {
    if xid == snapshot.current_xid {
        (cid < snapshot.curcid, false)
    } else if snapshot.xid_in_snapshot(xid) {
        (false, false)
    } else if txm.did_commit(xid) {
        (true, false)
    } else {
        (false, true)
    }
}

/// Walks from a delete/update record back to the inserting record,
/// passing through any tuple-lock records. `None` means the chain fell
/// behind the horizon, i.e. the insert is stable and committed.
fn walk_to_insert(
    undo: &UndoLog,
    recent_oldest: UndoPtr,
    mut rec: UndoRec,
) -> Result<Option<UndoRec>> {
    loop {
        let prev = rec.prev();
        if prev < recent_oldest {
            return Ok(None);
        }
        rec = match fetch(undo, prev)? {
            Some(rec) => rec,
            None => return Ok(None),
        };
        if !matches!(rec.payload, UndoPayload::TupleLock { .. }) {
            break;
        }
    }
    match rec.payload {
        UndoPayload::Insert { .. } => Ok(Some(rec)),
        _ => Err(ZedError::Corruption(
            "row chain does not end in an insert record".into(),
        )),
    }
}

fn satisfies_mvcc(
    undo: &UndoLog,
    txm: &TxManager,
    snapshot: &Snapshot,
    recent_oldest: UndoPtr,
    item: &UncompressedItem,
) -> Result<bool> {
    let deleted = is_deleted(item);
    let mut ptr = item.undo;
    loop {
        if ptr < recent_oldest {
            return Ok(!deleted);
        }
        let rec = match fetch(undo, ptr)? {
            Some(rec) => rec,
            None => return Ok(!deleted),
        };
        if !deleted {
            match rec.payload {
                UndoPayload::Insert { .. } => {
                    return Ok(xid_visible(txm, snapshot, rec.xid, rec.cid).0);
                }
                UndoPayload::TupleLock { prev, .. } => {
                    ptr = prev;
                    continue;
                }
                _ => {
                    return Err(ZedError::Corruption(
                        "unexpected undo record under a live item".into(),
                    ))
                }
            }
        }
        match rec.payload {
            UndoPayload::Delete { .. } | UndoPayload::Update { .. } => {}
            _ => {
                return Err(ZedError::Corruption(
                    "unexpected undo record under a deleted item".into(),
                ))
            }
        }
        if xid_visible(txm, snapshot, rec.xid, rec.cid).0 {
            // we can see the deletion
            return Ok(false);
        }
        // the deleter is invisible to us; the version is visible iff the
        // inserting transaction is
        return match walk_to_insert(undo, recent_oldest, rec)? {
            None => Ok(true),
            Some(insert) => Ok(xid_visible(txm, snapshot, insert.xid, insert.cid).0),
        };
    }
}

fn satisfies_self(
    undo: &UndoLog,
    txm: &TxManager,
    snapshot: &Snapshot,
    recent_oldest: UndoPtr,
    item: &UncompressedItem,
) -> Result<bool> {
    let deleted = is_deleted(item);
    let mut ptr = item.undo;
    loop {
        if ptr < recent_oldest {
            return Ok(!deleted);
        }
        let rec = match fetch(undo, ptr)? {
            Some(rec) => rec,
            None => return Ok(!deleted),
        };
        if !deleted {
            match rec.payload {
                UndoPayload::Insert { .. } => {
                    return Ok(rec.xid == snapshot.current_xid
                        || (!txm.is_in_progress(rec.xid) && txm.did_commit(rec.xid)));
                }
                UndoPayload::TupleLock { prev, .. } => {
                    ptr = prev;
                    continue;
                }
                _ => {
                    return Err(ZedError::Corruption(
                        "unexpected undo record under a live item".into(),
                    ))
                }
            }
        }
        return Ok(if rec.xid == snapshot.current_xid {
            false
        } else if txm.is_in_progress(rec.xid) {
            true
        } else {
            // a deleter that aborted leaves the version visible
            !txm.did_commit(rec.xid)
        });
    }
}

fn satisfies_dirty(
    undo: &UndoLog,
    txm: &TxManager,
    snapshot: &mut Snapshot,
    recent_oldest: UndoPtr,
    item: &UncompressedItem,
) -> Result<bool> {
    snapshot.xmin = Xid::INVALID;
    snapshot.xmax = Xid::INVALID;
    let deleted = is_deleted(item);
    let mut ptr = item.undo;
    loop {
        if ptr < recent_oldest {
            return Ok(!deleted);
        }
        let rec = match fetch(undo, ptr)? {
            Some(rec) => rec,
            None => return Ok(!deleted),
        };
        if !deleted {
            match rec.payload {
                UndoPayload::Insert { .. } => {
                    return Ok(if rec.xid == snapshot.current_xid {
                        true
                    } else if txm.is_in_progress(rec.xid) {
                        snapshot.xmin = rec.xid;
                        true
                    } else {
                        txm.did_commit(rec.xid)
                    });
                }
                UndoPayload::TupleLock { prev, .. } => {
                    ptr = prev;
                    continue;
                }
                _ => {
                    return Err(ZedError::Corruption(
                        "unexpected undo record under a live item".into(),
                    ))
                }
            }
        }
        return Ok(if rec.xid == snapshot.current_xid {
            false
        } else if txm.is_in_progress(rec.xid) {
            snapshot.xmax = rec.xid;
            true
        } else {
            !txm.did_commit(rec.xid)
        });
    }
}

fn satisfies_non_vacuumable(
    undo: &UndoLog,
    txm: &TxManager,
    snapshot: &Snapshot,
    recent_oldest: UndoPtr,
    item: &UncompressedItem,
) -> Result<bool> {
    let oldest_xmin = snapshot.xmin;
    if !oldest_xmin.is_valid() {
        return Err(ZedError::Invalid(
            "non-vacuumable snapshot needs an oldest-xmin horizon",
        ));
    }
    let deleted = is_deleted(item);
    let mut ptr = item.undo;
    loop {
        if ptr < recent_oldest {
            return Ok(!deleted);
        }
        let rec = match fetch(undo, ptr)? {
            Some(rec) => rec,
            None => return Ok(!deleted),
        };
        if !deleted {
            match rec.payload {
                UndoPayload::Insert { .. } => {
                    return Ok(txm.is_in_progress(rec.xid) || txm.did_commit(rec.xid));
                }
                UndoPayload::TupleLock { prev, .. } => {
                    ptr = prev;
                    continue;
                }
                _ => {
                    return Err(ZedError::Corruption(
                        "unexpected undo record under a live item".into(),
                    ))
                }
            }
        }
        if txm.is_in_progress(rec.xid) {
            return Ok(true); // delete in progress
        }
        if txm.did_commit(rec.xid) {
            // deleter committed, but an open transaction may still need
            // the version
            return Ok(rec.xid >= oldest_xmin);
        }
        // deleter aborted; the version lives if its inserter does
        return match walk_to_insert(undo, recent_oldest, rec)? {
            None => Ok(true),
            Some(insert) => Ok(txm.is_in_progress(insert.xid) || txm.did_commit(insert.xid)),
        };
    }
}

/// Decides whether `item` is visible under `snapshot`.
///
/// Works on single and array items; compressed containers carry no
/// visibility of their own. Dead items are invisible to everyone, and an
/// invalid UNDO pointer means "always visible": only the meta-attribute
/// stores live pointers, so data-attribute items short-circuit here.
pub fn satisfies_visibility(
    undo: &UndoLog,
    txm: &TxManager,
    snapshot: &mut Snapshot,
    recent_oldest: UndoPtr,
    item: &UncompressedItem,
) -> Result<bool> {
    debug_assert_eq!(item.flags & ITEM_COMPRESSED, 0);
    if item.is_dead() {
        return Ok(false);
    }
    if !item.undo.is_valid() {
        return Ok(true);
    }
    match snapshot.kind {
        SnapshotKind::Mvcc => satisfies_mvcc(undo, txm, snapshot, recent_oldest, item),
        SnapshotKind::SelfVisible => satisfies_self(undo, txm, snapshot, recent_oldest, item),
        SnapshotKind::Any => Ok(true),
        SnapshotKind::Dirty => satisfies_dirty(undo, txm, snapshot, recent_oldest, item),
        SnapshotKind::NonVacuumable => {
            satisfies_non_vacuumable(undo, txm, snapshot, recent_oldest, item)
        }
    }
}

/// Decides whether the current transaction may delete, update or lock
/// `item` with `mode`.
///
/// Besides the outcome, reports whether the item's existing UNDO record
/// is still of interest to anyone; a record of an aborted deleter, or one
/// behind the horizon, need not be chained from the replacement item.
pub fn satisfies_update(
    undo: &UndoLog,
    txm: &TxManager,
    snapshot: &Snapshot,
    recent_oldest: UndoPtr,
    item: &UncompressedItem,
    mode: LockMode,
) -> Result<(UpdateOutcome, bool)> {
    debug_assert_eq!(item.flags & ITEM_COMPRESSED, 0);
    let deleted = is_deleted(item);
    let mut ptr = item.undo;
    let mut chain_depth = 0;
    loop {
        chain_depth += 1;
        if ptr < recent_oldest {
            if deleted {
                // the delete is ancient yet the flag survives; nothing
                // here is updatable
                return Ok((UpdateOutcome::Invisible, true));
            }
            return Ok((UpdateOutcome::Ok, chain_depth > 1));
        }
        let rec = match fetch(undo, ptr)? {
            Some(rec) => rec,
            None => {
                if deleted {
                    return Ok((UpdateOutcome::Invisible, true));
                }
                return Ok((UpdateOutcome::Ok, chain_depth > 1));
            }
        };
        if !deleted {
            match rec.payload {
                UndoPayload::Insert { .. } => {
                    if rec.xid == snapshot.current_xid {
                        if rec.cid >= snapshot.curcid {
                            // inserted after this scan started
                            return Ok((UpdateOutcome::Invisible, true));
                        }
                        return Ok((UpdateOutcome::Ok, true));
                    }
                    if txm.is_in_progress(rec.xid) {
                        return Ok((UpdateOutcome::Invisible, true));
                    }
                    if txm.did_commit(rec.xid) {
                        return Ok((UpdateOutcome::Ok, true));
                    }
                    return Ok((UpdateOutcome::Invisible, true));
                }
                UndoPayload::TupleLock { prev, mode: held } => {
                    if rec.xid == snapshot.current_xid {
                        // a lock we already hold at this strength or
                        // stronger must succeed without waiting, or we
                        // would deadlock against anyone queued behind us
                        if held >= mode {
                            return Ok((UpdateOutcome::Ok, true));
                        }
                    } else if !lock_modes_compatible(held, mode) && txm.is_in_progress(rec.xid) {
                        return Ok((
                            UpdateOutcome::BeingModified(ConflictInfo {
                                conflicting_tid: item.tid,
                                xmax: rec.xid,
                                cmax: Cid::INVALID,
                            }),
                            true,
                        ));
                    }
                    // no conflict from this lock; older records may hold
                    // more locks
                    ptr = prev;
                    continue;
                }
                _ => {
                    return Err(ZedError::Corruption(
                        "unexpected undo record under a live item".into(),
                    ))
                }
            }
        }
        // deleted or updated-away item
        let (old_mode, next_tid) = match rec.payload {
            UndoPayload::Delete { .. } => (LockMode::Exclusive, item.tid),
            UndoPayload::Update {
                newtid, key_update, ..
            } => (
                if key_update {
                    LockMode::Exclusive
                } else {
                    LockMode::NoKeyExclusive
                },
                newtid,
            ),
            _ => {
                return Err(ZedError::Corruption(
                    "unexpected undo record under a deleted item".into(),
                ))
            }
        };
        if rec.xid == snapshot.current_xid {
            if lock_modes_compatible(old_mode, mode) {
                return Ok((UpdateOutcome::Ok, true));
            }
            if rec.cid >= snapshot.curcid {
                return Ok((
                    UpdateOutcome::SelfModified(ConflictInfo {
                        conflicting_tid: item.tid,
                        xmax: rec.xid,
                        cmax: rec.cid,
                    }),
                    true,
                ));
            }
            return Ok((UpdateOutcome::Invisible, true));
        }
        if txm.is_in_progress(rec.xid) {
            if lock_modes_compatible(old_mode, mode) {
                return Ok((UpdateOutcome::Ok, true));
            }
            return Ok((
                UpdateOutcome::BeingModified(ConflictInfo {
                    conflicting_tid: item.tid,
                    xmax: rec.xid,
                    cmax: Cid::INVALID,
                }),
                true,
            ));
        }
        if !txm.did_commit(rec.xid) {
            // deleter aborted or crashed; its record can be discarded
            return Ok((UpdateOutcome::Ok, false));
        }
        return Ok(match rec.payload {
            UndoPayload::Delete { .. } => (
                UpdateOutcome::Deleted(ConflictInfo {
                    conflicting_tid: item.tid,
                    xmax: rec.xid,
                    cmax: Cid::INVALID,
                }),
                true,
            ),
            _ => {
                if lock_modes_compatible(old_mode, mode) {
                    (UpdateOutcome::Ok, true)
                } else {
                    (
                        UpdateOutcome::Updated(ConflictInfo {
                            conflicting_tid: next_tid,
                            xmax: rec.xid,
                            cmax: Cid::INVALID,
                        }),
                        true,
                    )
                }
            }
        });
    }
}
