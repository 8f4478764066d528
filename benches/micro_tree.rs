use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use tempfile::tempdir;

use zedstore::storage::item::AttrDesc;
use zedstore::{Cid, Pager, PagerOptions, Table, TableOptions, Tid};

const ROWS: usize = 10_000;

fn make_table(dir: &tempfile::TempDir) -> Table {
    let pager = Arc::new(
        Pager::create(dir.path().join("bench.db"), PagerOptions::default())
            .expect("create pager"),
    );
    Table::create(TableOptions::new(pager).attr(AttrDesc {
        attlen: 64,
        attbyval: false,
    }))
    .expect("create table")
}

fn populated_table(dir: &tempfile::TempDir) -> Table {
    let table = make_table(dir);
    let txm = table.tx_manager().clone();
    let xid = txm.begin();
    let rows: Vec<Vec<Option<Vec<u8>>>> = (0..ROWS)
        .map(|i| vec![Some(vec![(i % 251) as u8; 64])])
        .collect();
    table.insert_rows(&rows, xid, Cid(0)).expect("insert rows");
    txm.commit(xid);
    table
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");
    group.throughput(Throughput::Elements(ROWS as u64));
    group.sample_size(10);
    group.bench_function("multi_insert_10k", |b| {
        b.iter_batched(
            tempdir,
            |dir| {
                let dir = dir.expect("tempdir");
                let table = populated_table(&dir);
                drop(table);
            },
            BatchSize::PerIteration,
        )
    });
    group.finish();
}

fn bench_scan(c: &mut Criterion) {
    let dir = tempdir().expect("tempdir");
    let table = populated_table(&dir);
    let txm = table.tx_manager().clone();
    let mut group = c.benchmark_group("scan");
    group.throughput(Throughput::Elements(ROWS as u64));
    group.bench_function("row_scan_10k", |b| {
        b.iter(|| {
            let reader = txm.begin();
            let snapshot = txm.snapshot(reader, Cid(0));
            let mut scan = table
                .begin_row_scan(&[1], Tid::MIN, Tid::MAX, snapshot)
                .expect("scan begin");
            let mut count = 0u64;
            while scan.next().expect("scan next").is_some() {
                count += 1;
            }
            assert_eq!(count, ROWS as u64);
        })
    });
    group.finish();
}

criterion_group!(benches, bench_insert, bench_scan);
criterion_main!(benches);
