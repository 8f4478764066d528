//! Snapshot semantics, update conflicts and the idempotence laws of the
//! vacuum entry points.

use std::sync::Arc;

use tempfile::tempdir;

use zedstore::storage::item::AttrDesc;
use zedstore::storage::meta::META_ATTNO;
use zedstore::storage::visibility::UpdateOutcome;
use zedstore::{
    Cid, LockMode, Pager, PagerOptions, Result, Snapshot, Table, TableOptions, Tid, UndoPtr, Xid,
};

const BYTES8: AttrDesc = AttrDesc {
    attlen: 8,
    attbyval: true,
};

fn setup() -> Result<(tempfile::TempDir, Arc<Pager>, Table)> {
    let dir = tempdir()?;
    let pager = Arc::new(Pager::create(
        dir.path().join("vis.db"),
        PagerOptions::default(),
    )?);
    let table = Table::create(TableOptions::new(pager.clone()).attr(BYTES8))?;
    Ok((dir, pager, table))
}

fn row(byte: u8) -> Vec<Vec<Option<Vec<u8>>>> {
    vec![vec![Some(vec![byte; 8])]]
}

fn visible_tids(table: &Table, snapshot: Snapshot) -> Result<Vec<Tid>> {
    let mut scan = table.begin_scan(META_ATTNO, Tid::MIN, Tid::MAX, snapshot)?;
    let mut tids = Vec::new();
    while let Some((tid, _)) = scan.next()? {
        tids.push(tid);
    }
    Ok(tids)
}

#[test]
fn uncommitted_inserts_are_invisible_to_others() -> Result<()> {
    let (_dir, _pager, table) = setup()?;
    let txm = table.tx_manager().clone();
    let writer = txm.begin();
    let tids = table.insert_rows(&row(1), writer, Cid(0))?;

    let reader = txm.begin();
    assert!(visible_tids(&table, txm.snapshot(reader, Cid(0)))?.is_empty());

    // the writer's own snapshot sees it (the insert happened at cid 0,
    // the scan looks from cid 1)
    assert_eq!(
        visible_tids(&table, txm.snapshot(writer, Cid(1)))?,
        tids,
        "own insert visible to a later command"
    );
    // but not to the command that is still at the insert's cid
    assert!(visible_tids(&table, txm.snapshot(writer, Cid(0)))?.is_empty());

    txm.commit(writer);
    // a pre-commit snapshot stays fixed; a fresh one sees the row
    let late = txm.begin();
    assert_eq!(visible_tids(&table, txm.snapshot(late, Cid(0)))?, tids);
    Ok(())
}

#[test]
fn aborted_inserts_stay_invisible() -> Result<()> {
    let (_dir, _pager, table) = setup()?;
    let txm = table.tx_manager().clone();
    let writer = txm.begin();
    table.insert_rows(&row(1), writer, Cid(0))?;
    txm.abort(writer);
    let reader = txm.begin();
    assert!(visible_tids(&table, txm.snapshot(reader, Cid(0)))?.is_empty());
    Ok(())
}

#[test]
fn self_snapshot_sees_own_uncommitted_work() -> Result<()> {
    let (_dir, _pager, table) = setup()?;
    let txm = table.tx_manager().clone();
    let writer = txm.begin();
    let tids = table.insert_rows(&row(1), writer, Cid(0))?;
    assert_eq!(
        visible_tids(&table, Snapshot::self_visible(writer, Cid(1)))?,
        tids
    );
    // another in-progress transaction's work is hidden
    let other = txm.begin();
    assert!(visible_tids(&table, Snapshot::self_visible(other, Cid(0)))?.is_empty());
    Ok(())
}

#[test]
fn any_snapshot_sees_everything_not_dead() -> Result<()> {
    let (_dir, _pager, table) = setup()?;
    let txm = table.tx_manager().clone();
    let writer = txm.begin();
    let tids = table.insert_rows(&row(1), writer, Cid(0))?;
    txm.abort(writer);
    assert_eq!(visible_tids(&table, Snapshot::any())?, tids);
    Ok(())
}

#[test]
fn dirty_snapshot_reports_the_inserting_xid() -> Result<()> {
    let (_dir, _pager, table) = setup()?;
    let txm = table.tx_manager().clone();
    let writer = txm.begin();
    let tids = table.insert_rows(&row(1), writer, Cid(0))?;

    let mut scan = table.begin_scan(META_ATTNO, Tid::MIN, Tid::MAX, Snapshot::dirty())?;
    let got = scan.next()?;
    assert_eq!(got.map(|t| t.0), Some(tids[0]));
    assert_eq!(
        scan.snapshot().xmin,
        writer,
        "dirty scan surfaces the in-progress inserter"
    );
    Ok(())
}

#[test]
fn non_vacuumable_keeps_recently_deleted_rows() -> Result<()> {
    let (_dir, _pager, table) = setup()?;
    let txm = table.tx_manager().clone();
    let writer = txm.begin();
    let tids = table.insert_rows(&row(1), writer, Cid(0))?;
    txm.commit(writer);
    let deleter = txm.begin();
    table.delete_row(tids[0], deleter, Cid(0), &txm.snapshot(deleter, Cid(0)))?;
    txm.commit(deleter);

    // an open transaction older than the deleter could still need it
    let visible = visible_tids(&table, Snapshot::non_vacuumable(deleter))?;
    assert_eq!(visible, tids, "deleter not behind the horizon yet");

    // once every snapshot postdates the deleter, the row is vacuumable
    let horizon = Xid(deleter.0 + 1);
    assert!(visible_tids(&table, Snapshot::non_vacuumable(horizon))?.is_empty());
    Ok(())
}

#[test]
fn delete_conflicts_surface_as_structured_outcomes() -> Result<()> {
    let (_dir, _pager, table) = setup()?;
    let txm = table.tx_manager().clone();
    let writer = txm.begin();
    let tids = table.insert_rows(&row(1), writer, Cid(0))?;
    txm.commit(writer);

    // t1 deletes but has not committed; t2 must not wait inside the tree
    let t1 = txm.begin();
    let outcome = table.delete_row(tids[0], t1, Cid(0), &txm.snapshot(t1, Cid(0)))?;
    assert!(outcome.is_ok());

    let t2 = txm.begin();
    match table.delete_row(tids[0], t2, Cid(0), &txm.snapshot(t2, Cid(0)))? {
        UpdateOutcome::BeingModified(info) => {
            assert_eq!(info.conflicting_tid, tids[0]);
            assert_eq!(info.xmax, t1);
        }
        other => panic!("expected BeingModified, got {other:?}"),
    }

    // after t1 commits, the row is gone for good
    txm.commit(t1);
    let t3 = txm.begin();
    match table.delete_row(tids[0], t3, Cid(0), &txm.snapshot(t3, Cid(0)))? {
        UpdateOutcome::Deleted(info) => assert_eq!(info.xmax, t1),
        other => panic!("expected Deleted, got {other:?}"),
    }
    Ok(())
}

#[test]
fn aborted_deleter_frees_the_row_for_the_next_writer() -> Result<()> {
    let (_dir, _pager, table) = setup()?;
    let txm = table.tx_manager().clone();
    let writer = txm.begin();
    let tids = table.insert_rows(&row(1), writer, Cid(0))?;
    txm.commit(writer);

    let t1 = txm.begin();
    table.delete_row(tids[0], t1, Cid(0), &txm.snapshot(t1, Cid(0)))?;
    txm.abort(t1);

    let t2 = txm.begin();
    let outcome = table.delete_row(tids[0], t2, Cid(0), &txm.snapshot(t2, Cid(0)))?;
    assert!(outcome.is_ok(), "aborted delete must not block: {outcome:?}");
    Ok(())
}

#[test]
fn self_modified_within_the_same_command() -> Result<()> {
    let (_dir, _pager, table) = setup()?;
    let txm = table.tx_manager().clone();
    let writer = txm.begin();
    let tids = table.insert_rows(&row(1), writer, Cid(0))?;
    txm.commit(writer);

    let t = txm.begin();
    let snapshot = txm.snapshot(t, Cid(0));
    assert!(table.delete_row(tids[0], t, Cid(0), &snapshot)?.is_ok());
    // the same command tripping over its own delete
    match table.delete_row(tids[0], t, Cid(0), &snapshot)? {
        UpdateOutcome::SelfModified(info) => assert_eq!(info.cmax, Cid(0)),
        other => panic!("expected SelfModified, got {other:?}"),
    }
    Ok(())
}

#[test]
fn committed_update_reports_the_successor_version() -> Result<()> {
    let (_dir, _pager, table) = setup()?;
    let txm = table.tx_manager().clone();
    let writer = txm.begin();
    let tids = table.insert_rows(&row(1), writer, Cid(0))?;
    txm.commit(writer);

    let t1 = txm.begin();
    let (outcome, new_tid) =
        table.update_row(tids[0], &[Some(vec![9u8; 8])], t1, Cid(0), false, &txm.snapshot(t1, Cid(0)))?;
    assert!(outcome.is_ok());
    txm.commit(t1);

    let t2 = txm.begin();
    match table.delete_row(tids[0], t2, Cid(0), &txm.snapshot(t2, Cid(0)))? {
        UpdateOutcome::Updated(info) => {
            assert_eq!(info.conflicting_tid, new_tid, "points at the new version");
            assert_eq!(info.xmax, t1);
        }
        other => panic!("expected Updated, got {other:?}"),
    }
    Ok(())
}

#[test]
fn tuple_locks_follow_the_compatibility_matrix() -> Result<()> {
    let (_dir, _pager, table) = setup()?;
    let txm = table.tx_manager().clone();
    let writer = txm.begin();
    let tids = table.insert_rows(&row(1), writer, Cid(0))?;
    txm.commit(writer);

    let t1 = txm.begin();
    let outcome = table.lock_row(tids[0], t1, Cid(0), LockMode::KeyShare, &txm.snapshot(t1, Cid(0)))?;
    assert!(outcome.is_ok());

    // Share is compatible with a held KeyShare
    let t2 = txm.begin();
    let outcome = table.lock_row(tids[0], t2, Cid(0), LockMode::Share, &txm.snapshot(t2, Cid(0)))?;
    assert!(outcome.is_ok(), "{outcome:?}");

    // Exclusive conflicts with the held Share
    let t3 = txm.begin();
    match table.lock_row(tids[0], t3, Cid(0), LockMode::Exclusive, &txm.snapshot(t3, Cid(0)))? {
        UpdateOutcome::BeingModified(info) => assert_eq!(info.xmax, t2),
        other => panic!("expected BeingModified, got {other:?}"),
    }

    // re-taking a weaker lock than one we already hold succeeds without
    // touching the chain again
    let outcome = table.lock_row(tids[0], t2, Cid(0), LockMode::KeyShare, &txm.snapshot(t2, Cid(0)))?;
    assert!(outcome.is_ok(), "{outcome:?}");
    Ok(())
}

#[test]
fn missing_tids_come_back_as_missing_not_errors() -> Result<()> {
    let (_dir, _pager, table) = setup()?;
    let txm = table.tx_manager().clone();
    let writer = txm.begin();
    table.insert_rows(&row(1), writer, Cid(0))?;
    txm.commit(writer);
    let t = txm.begin();
    let snapshot = txm.snapshot(t, Cid(0));
    assert_eq!(
        table.delete_row(Tid(999), t, Cid(0), &snapshot)?,
        UpdateOutcome::Missing
    );
    assert_eq!(
        table.lock_row(Tid(999), t, Cid(0), LockMode::Share, &snapshot)?,
        UpdateOutcome::Missing
    );
    Ok(())
}

#[test]
fn undo_item_deletion_restores_only_the_matching_pointer() -> Result<()> {
    let (_dir, pager, table) = setup()?;
    let txm = table.tx_manager().clone();
    let writer = txm.begin();
    let tids = table.insert_rows(&row(1), writer, Cid(0))?;
    txm.commit(writer);

    let deleter = txm.begin();
    table.delete_row(tids[0], deleter, Cid(0), &txm.snapshot(deleter, Cid(0)))?;
    txm.commit(deleter);

    let reader = txm.begin();
    assert!(visible_tids(&table, txm.snapshot(reader, Cid(0)))?.is_empty());

    // a stale pointer is a no-op
    table.undo_item_deletion(META_ATTNO, tids[0], UndoPtr(u64::MAX - 1))?;
    assert!(visible_tids(&table, txm.snapshot(reader, Cid(0)))?.is_empty());

    // the item's current pointer (the delete record) rolls it back
    let current = item_undo_ptr(&pager, META_ATTNO, tids[0])?;
    table.undo_item_deletion(META_ATTNO, tids[0], current)?;
    let reader = txm.begin();
    assert_eq!(visible_tids(&table, txm.snapshot(reader, Cid(0)))?, tids);
    Ok(())
}

/// Reads the UNDO pointer of the item covering `tid` straight off the
/// leaf page.
fn item_undo_ptr(pager: &Pager, attno: u16, tid: Tid) -> Result<UndoPtr> {
    use zedstore::storage::btree::internal;
    use zedstore::storage::compress::Decompressor;
    use zedstore::storage::item::Item;
    use zedstore::storage::{meta, page};
    use zedstore::types::INVALID_BLOCK;

    let (mut blk, _) = meta::get_root(pager, attno, false)?;
    assert_ne!(blk, INVALID_BLOCK, "tree exists");
    loop {
        let pin = pager.pin(blk)?;
        let guard = pin.read();
        let opaque = page::tree_opaque(&guard)?;
        if !opaque.is_leaf() {
            let idx = internal::search(&guard, tid).expect("key in range");
            blk = internal::entry(&guard, idx).1;
            continue;
        }
        for off in 1..=page::max_offset(&guard) {
            match Item::decode(page::item(&guard, off)?)? {
                Item::Uncompressed(item) if item.covers(tid) => return Ok(item.undo),
                Item::Compressed(container) if container.tid <= tid && tid <= container.lasttid => {
                    let mut decompressor = Decompressor::new(&container)?;
                    while let Some(inner) = decompressor.next_item()? {
                        if inner.covers(tid) {
                            return Ok(inner.undo);
                        }
                    }
                }
                _ => {}
            }
        }
        panic!("no item covers {tid}");
    }
}

#[test]
fn tids_assign_monotonically_across_batches() -> Result<()> {
    let (_dir, _pager, table) = setup()?;
    let txm = table.tx_manager().clone();
    let mut last = Tid::INVALID;
    for round in 0..20u8 {
        let xid = txm.begin();
        let tids = table.insert_rows(&row(round), xid, Cid(0))?;
        txm.commit(xid);
        assert!(tids[0] > last, "TIDs must increase across inserts");
        last = tids[0];
    }
    Ok(())
}
