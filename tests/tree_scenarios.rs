//! End-to-end storage scenarios driven through the table API, with the
//! on-disk structures inspected page by page.

use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

use zedstore::storage::btree::internal;
use zedstore::storage::compress::Decompressor;
use zedstore::storage::item::{AttrDesc, Item, UncompressedItem, ITEM_DELETED};
use zedstore::storage::meta::{self, META_ATTNO};
use zedstore::storage::page;
use zedstore::storage::undo::UndoPayload;
use zedstore::types::INVALID_BLOCK;
use zedstore::{Cid, Pager, PagerOptions, Result, Table, TableOptions, Tid};

fn setup(attrs: &[AttrDesc]) -> Result<(tempfile::TempDir, Arc<Pager>, Table)> {
    let dir = tempdir()?;
    let pager = Arc::new(Pager::create(
        dir.path().join("table.db"),
        PagerOptions::default(),
    )?);
    let mut options = TableOptions::new(pager.clone());
    for attr in attrs {
        options = options.attr(*attr);
    }
    let table = Table::create(options)?;
    Ok((dir, pager, table))
}

/// Read-only descent to the leaf covering `tid`, outside the engine.
fn find_leaf_block(pager: &Pager, attno: u16, tid: Tid) -> Result<Option<u32>> {
    let (mut blk, _) = meta::get_root(pager, attno, false)?;
    if blk == INVALID_BLOCK {
        return Ok(None);
    }
    loop {
        let pin = pager.pin(blk)?;
        let guard = pin.read();
        let opaque = page::tree_opaque(&guard)?;
        if opaque.is_leaf() {
            return Ok(Some(blk));
        }
        let idx = internal::search(&guard, tid).expect("key below tree range");
        blk = internal::entry(&guard, idx).1;
    }
}

fn find_item(pager: &Pager, attno: u16, tid: Tid) -> Result<Option<UncompressedItem>> {
    let Some(blk) = find_leaf_block(pager, attno, tid)? else {
        return Ok(None);
    };
    let pin = pager.pin(blk)?;
    let guard = pin.read();
    for off in 1..=page::max_offset(&guard) {
        match Item::decode(page::item(&guard, off)?)? {
            Item::Uncompressed(item) if item.covers(tid) => return Ok(Some(item)),
            Item::Compressed(container) if container.tid <= tid && tid <= container.lasttid => {
                let mut decompressor = Decompressor::new(&container)?;
                while let Some(inner) = decompressor.next_item()? {
                    if inner.covers(tid) {
                        return Ok(Some(inner));
                    }
                }
                return Ok(None);
            }
            _ => {}
        }
    }
    Ok(None)
}

fn count_leaves(pager: &Pager, attno: u16) -> Result<usize> {
    let Some(mut blk) = find_leaf_block(pager, attno, Tid::MIN)? else {
        return Ok(0);
    };
    let mut count = 0;
    loop {
        count += 1;
        let pin = pager.pin(blk)?;
        let guard = pin.read();
        let next = page::tree_opaque(&guard)?.next;
        if next == INVALID_BLOCK {
            return Ok(count);
        }
        assert_ne!(next, blk, "right link points to itself");
        blk = next;
    }
}

const WIDE: AttrDesc = AttrDesc {
    attlen: 200,
    attbyval: false,
};

const VARLEN: AttrDesc = AttrDesc {
    attlen: -1,
    attbyval: false,
};

/// High-entropy fixed-width rows; compressible payloads would let the
/// rewriter shrink everything onto one leaf and mask split behavior.
fn wide_rows(count: usize) -> Vec<Vec<Option<Vec<u8>>>> {
    let mut rng = ChaCha8Rng::seed_from_u64(101);
    (0..count)
        .map(|_| {
            let datum: Vec<u8> = (0..200).map(|_| rng.gen()).collect();
            vec![Some(datum)]
        })
        .collect()
}

#[test]
fn array_build_and_split() -> Result<()> {
    let (_dir, pager, table) = setup(&[WIDE])?;
    let txm = table.tx_manager().clone();
    let xid = txm.begin();
    let tids = table.insert_rows(&wide_rows(1000), xid, Cid(0))?;
    txm.commit(xid);
    assert_eq!(tids.first(), Some(&Tid(1)));
    assert_eq!(tids.last(), Some(&Tid(1000)));

    assert!(
        count_leaves(&pager, 1)? >= 2,
        "1000 x 200-byte datums must split the attribute tree"
    );

    let reader = txm.begin();
    let snapshot = txm.snapshot(reader, Cid(0));
    let mut scan = table.begin_row_scan(&[1], Tid(1), Tid(1001), snapshot)?;
    let mut expect = 1u64;
    while let Some((tid, row)) = scan.next()? {
        assert_eq!(tid, Tid(expect), "tuples must come back in TID order");
        let datum = row[0].as_ref().expect("no nulls inserted");
        assert_eq!(datum.len(), 200);
        expect += 1;
    }
    assert_eq!(expect, 1001, "scan must return all 1000 tuples");
    assert_eq!(table.get_last_tid(META_ATTNO)?, Tid(1001));
    assert_eq!(table.get_last_tid(1)?, Tid(1001));
    Ok(())
}

#[test]
fn mid_array_delete_splits_and_respects_snapshots() -> Result<()> {
    let (_dir, pager, table) = setup(&[WIDE])?;
    let txm = table.tx_manager().clone();
    let xid = txm.begin();
    table.insert_rows(&wide_rows(1000), xid, Cid(0))?;
    txm.commit(xid);

    // a reader that starts before the delete commits must not see it
    let old_reader = txm.begin();
    let x1 = txm.begin();
    let old_snapshot = txm.snapshot(old_reader, Cid(0));
    let outcome = table.delete_row(Tid(500), x1, Cid(0), &txm.snapshot(x1, Cid(0)))?;
    assert!(outcome.is_ok(), "{outcome:?}");
    txm.commit(x1);

    // the meta leaf now carries the three-way split around TID 500
    let left = find_item(&pager, META_ATTNO, Tid(499))?.expect("left piece");
    assert_eq!((left.tid, left.last_tid()), (Tid(1), Tid(499)));
    let mid = find_item(&pager, META_ATTNO, Tid(500))?.expect("deleted marker");
    assert_eq!(mid.nelements, 1);
    assert_ne!(mid.flags & ITEM_DELETED, 0);
    let right = find_item(&pager, META_ATTNO, Tid(501))?.expect("right piece");
    assert_eq!((right.tid, right.last_tid()), (Tid(501), Tid(1000)));

    let count_rows = |snapshot| -> Result<(u64, bool)> {
        let mut scan = table.begin_row_scan(&[1], Tid(1), Tid(1001), snapshot)?;
        let mut count = 0;
        let mut saw_500 = false;
        while let Some((tid, _)) = scan.next()? {
            count += 1;
            saw_500 |= tid == Tid(500);
        }
        Ok((count, saw_500))
    };

    let fresh = txm.begin();
    let (count, saw_500) = count_rows(txm.snapshot(fresh, Cid(0)))?;
    assert_eq!(count, 999, "committed delete hides one row");
    assert!(!saw_500);

    // the snapshot taken while the deleter was still in progress
    let (count, saw_500) = count_rows(old_snapshot)?;
    assert_eq!(count, 1000, "old snapshot still sees the deleted row");
    assert!(saw_500);
    Ok(())
}

#[test]
fn update_chain_links_versions_through_undo() -> Result<()> {
    let (_dir, pager, table) = setup(&[WIDE])?;
    let txm = table.tx_manager().clone();
    let xid = txm.begin();
    table.insert_rows(&wide_rows(1000), xid, Cid(0))?;
    txm.commit(xid);

    let mut versions = vec![Tid(10)];
    let mut first_update_snapshot = None;
    for round in 0..3u8 {
        let xid = txm.begin();
        let snapshot = txm.snapshot(xid, Cid(0));
        let (outcome, new_tid) = table.update_row(
            *versions.last().expect("seeded"),
            &[Some(vec![round; 200])],
            xid,
            Cid(0),
            false,
            &snapshot,
        )?;
        assert!(outcome.is_ok(), "{outcome:?}");
        versions.push(new_tid);
        txm.commit(xid);
        if round == 0 {
            let reader = txm.begin();
            first_update_snapshot = Some(txm.snapshot(reader, Cid(0)));
        }
    }
    assert_eq!(versions, vec![Tid(10), Tid(1001), Tid(1002), Tid(1003)]);

    // hop the chain of update records from the original item
    let mut tid = Tid(10);
    let mut hops = Vec::new();
    loop {
        let item = find_item(&pager, META_ATTNO, tid)?.expect("version item");
        let rec = table
            .undo_log()
            .fetch(item.undo)?
            .expect("records still live");
        match rec.payload {
            UndoPayload::Update { newtid, .. } => {
                hops.push(newtid);
                tid = newtid;
            }
            UndoPayload::Insert { .. } => break,
            other => panic!("unexpected record in version chain: {other:?}"),
        }
    }
    assert_eq!(hops, vec![Tid(1001), Tid(1002), Tid(1003)]);

    // a snapshot that saw only the first update reads the row at 1001
    let snapshot = first_update_snapshot.expect("taken after round 0");
    let mut scan = table.begin_row_scan(&[1], Tid(1), Tid(2000), snapshot)?;
    let mut seen = Vec::new();
    while let Some((tid, _)) = scan.next()? {
        if tid == Tid(10) || tid >= Tid(1001) {
            seen.push(tid);
        }
    }
    assert_eq!(seen, vec![Tid(1001)], "exactly the first updated version");
    Ok(())
}

#[test]
fn incompressible_datums_are_stored_uncompressed() -> Result<()> {
    let (_dir, pager, table) = setup(&[VARLEN])?;
    let txm = table.tx_manager().clone();
    let mut rng = ChaCha8Rng::seed_from_u64(0x5EED);
    let rows: Vec<Vec<Option<Vec<u8>>>> = (0..10)
        .map(|_| {
            let datum: Vec<u8> = (0..600).map(|_| rng.gen()).collect();
            vec![Some(datum)]
        })
        .collect();
    let xid = txm.begin();
    let tids = table.insert_rows(&rows, xid, Cid(0))?;
    txm.commit(xid);

    // the first insert into an empty leaf goes through the rewriter,
    // which must have given up on compressing random bytes
    let blk = find_leaf_block(&pager, 1, Tid(1))?.expect("attribute leaf");
    let pin = pager.pin(blk)?;
    let guard = pin.read();
    assert!(page::max_offset(&guard) > 0);
    for off in 1..=page::max_offset(&guard) {
        let item = Item::decode(page::item(&guard, off)?)?;
        assert!(
            matches!(item, Item::Uncompressed(_)),
            "high-entropy payloads must stay uncompressed"
        );
    }
    drop(guard);

    let reader = txm.begin();
    let mut scan = table.begin_row_scan(&[1], Tid(1), Tid(100), txm.snapshot(reader, Cid(0)))?;
    for (i, tid) in tids.iter().enumerate() {
        let (got_tid, row) = scan.next()?.expect("row present");
        assert_eq!(got_tid, *tid);
        assert_eq!(row[0], rows[i][0]);
    }
    assert!(scan.next()?.is_none());
    Ok(())
}

#[test]
fn added_attributes_get_their_own_trees() -> Result<()> {
    let (_dir, _pager, mut table) = setup(&[WIDE])?;
    let txm = table.tx_manager().clone();
    let xid = txm.begin();
    table.insert_rows(&wide_rows(5), xid, Cid(0))?;
    txm.commit(xid);

    table.add_attributes(&[VARLEN])?;
    assert_eq!(table.nattrs(), 2);

    // new rows carry both attributes
    let xid = txm.begin();
    let rows = vec![vec![Some(vec![7u8; 200]), Some(b"hello".to_vec())]];
    let tids = table.insert_rows(&rows, xid, Cid(0))?;
    txm.commit(xid);

    let reader = txm.begin();
    let mut scan = table.begin_row_scan(
        &[2],
        tids[0],
        tids[0].next(),
        txm.snapshot(reader, Cid(0)),
    )?;
    let (_, row) = scan.next()?.expect("new row");
    assert_eq!(row[0].as_deref(), Some(&b"hello"[..]));
    Ok(())
}

#[test]
fn null_runs_round_trip_as_null_arrays() -> Result<()> {
    let (_dir, pager, table) = setup(&[VARLEN])?;
    let txm = table.tx_manager().clone();
    let mut rows: Vec<Vec<Option<Vec<u8>>>> = (0..8).map(|_| vec![None]).collect();
    rows.push(vec![Some(b"tail".to_vec())]);
    let xid = txm.begin();
    table.insert_rows(&rows, xid, Cid(0))?;
    txm.commit(xid);

    // the run of nulls shares one array item with the null flag set
    let item = find_item(&pager, 1, Tid(3))?.expect("null array");
    assert!(item.is_null());
    assert_eq!((item.tid, item.last_tid()), (Tid(1), Tid(8)));

    let reader = txm.begin();
    let mut scan = table.begin_row_scan(&[1], Tid(1), Tid(100), txm.snapshot(reader, Cid(0)))?;
    let mut datums = Vec::new();
    while let Some((_, row)) = scan.next()? {
        datums.push(row[0].clone());
    }
    assert_eq!(datums.len(), 9);
    assert!(datums[..8].iter().all(|d| d.is_none()));
    assert_eq!(datums[8].as_deref(), Some(&b"tail"[..]));
    Ok(())
}
