//! Table façade: ties the per-attribute trees of one table together.
//!
//! A table is a metapage, one tree per attribute (the visibility-bearing
//! meta-attribute at number 0, data attributes from 1), and an UNDO log,
//! all sharing one pager. The per-attribute operations are exposed
//! directly; the row-level helpers orchestrate them the way the SQL
//! layer would: meta-attribute first for TIDs and the single UNDO
//! record, data attributes after.

use std::sync::Arc;

use crate::error::{Result, ZedError};
use crate::primitives::pager::Pager;
use crate::storage::btree::{ops, scan::TreeScan, Rel};
use crate::storage::item::AttrDesc;
use crate::storage::meta::{self, META_ATTNO};
use crate::storage::txn::{LockMode, Snapshot, TxManager};
use crate::storage::undo::UndoLog;
use crate::storage::visibility::UpdateOutcome;
use crate::types::{Cid, Tid, UndoPtr, Xid};

/// Options for creating or opening a [`Table`].
pub struct TableOptions {
    pager: Arc<Pager>,
    txm: Arc<TxManager>,
    attrs: Vec<AttrDesc>,
}

impl TableOptions {
    pub fn new(pager: Arc<Pager>) -> TableOptions {
        TableOptions {
            pager,
            txm: Arc::new(TxManager::new()),
            attrs: Vec::new(),
        }
    }

    /// Shares a transaction manager across tables.
    pub fn tx_manager(mut self, txm: Arc<TxManager>) -> TableOptions {
        self.txm = txm;
        self
    }

    /// Declares one data attribute (create only; 1-based numbers are
    /// assigned in declaration order).
    pub fn attr(mut self, desc: AttrDesc) -> TableOptions {
        self.attrs.push(desc);
        self
    }
}

pub struct Table {
    rel: Rel,
    nattrs: u16,
}

impl Table {
    /// Formats the metapage of an empty file and opens the table.
    pub fn create(options: TableOptions) -> Result<Table> {
        meta::init_metapage(&options.pager, &options.attrs)?;
        let undo = Arc::new(UndoLog::new(options.pager.clone()));
        let nattrs = meta::nattrs(&options.pager)?;
        Ok(Table {
            rel: Rel {
                pager: options.pager,
                txm: options.txm,
                undo,
            },
            nattrs,
        })
    }

    /// Opens an existing table, rebuilding the UNDO page index.
    pub fn open(options: TableOptions) -> Result<Table> {
        if !options.attrs.is_empty() {
            return Err(ZedError::Invalid("attributes are declared at create time"));
        }
        let undo = Arc::new(UndoLog::open(options.pager.clone())?);
        let nattrs = meta::nattrs(&options.pager)?;
        Ok(Table {
            rel: Rel {
                pager: options.pager,
                txm: options.txm,
                undo,
            },
            nattrs,
        })
    }

    pub fn tx_manager(&self) -> &Arc<TxManager> {
        &self.rel.txm
    }

    pub fn undo_log(&self) -> &UndoLog {
        self.rel.undo.as_ref()
    }

    /// Number of data attributes.
    pub fn nattrs(&self) -> u16 {
        self.nattrs - 1
    }

    /// Extends the root directory for newly added attributes.
    pub fn add_attributes(&mut self, attrs: &[AttrDesc]) -> Result<()> {
        meta::add_attributes(&self.rel.pager, attrs)?;
        self.nattrs = meta::nattrs(&self.rel.pager)?;
        Ok(())
    }

    /// Writes all dirty pages back to the file.
    pub fn checkpoint(&self) -> Result<()> {
        self.rel.pager.flush()
    }

    fn check_attno(&self, attno: u16) -> Result<()> {
        if attno >= self.nattrs {
            return Err(ZedError::Invalid("attribute number out of range"));
        }
        Ok(())
    }

    // Per-attribute operations.

    pub fn begin_scan(
        &self,
        attno: u16,
        start: Tid,
        end: Tid,
        snapshot: Snapshot,
    ) -> Result<TreeScan<'_>> {
        self.check_attno(attno)?;
        ops::begin_scan(&self.rel, attno, start, end, snapshot)
    }

    pub fn get_last_tid(&self, attno: u16) -> Result<Tid> {
        self.check_attno(attno)?;
        ops::get_last_tid(&self.rel, attno)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn multi_insert(
        &self,
        attno: u16,
        datums: &[&[u8]],
        isnulls: &[bool],
        tids: &mut [Tid],
        xid: Xid,
        cid: Cid,
        undo_ptr: &mut UndoPtr,
    ) -> Result<()> {
        self.check_attno(attno)?;
        ops::multi_insert(&self.rel, attno, datums, isnulls, tids, xid, cid, undo_ptr)
    }

    pub fn delete(
        &self,
        attno: u16,
        tid: Tid,
        xid: Xid,
        cid: Cid,
        snapshot: &Snapshot,
    ) -> Result<UpdateOutcome> {
        self.check_attno(attno)?;
        ops::delete(&self.rel, attno, tid, xid, cid, snapshot)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &self,
        attno: u16,
        otid: Tid,
        new_datum: &[u8],
        new_isnull: bool,
        xid: Xid,
        cid: Cid,
        key_update: bool,
        snapshot: &Snapshot,
    ) -> Result<(UpdateOutcome, Tid)> {
        self.check_attno(attno)?;
        ops::update(
            &self.rel, attno, otid, new_datum, new_isnull, xid, cid, key_update, snapshot,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn lock_item(
        &self,
        attno: u16,
        tid: Tid,
        xid: Xid,
        cid: Cid,
        mode: LockMode,
        snapshot: &Snapshot,
    ) -> Result<UpdateOutcome> {
        self.check_attno(attno)?;
        ops::lock_item(&self.rel, attno, tid, xid, cid, mode, snapshot)
    }

    pub fn mark_item_dead(&self, attno: u16, tid: Tid, undo_ptr: UndoPtr) -> Result<()> {
        self.check_attno(attno)?;
        ops::mark_item_dead(&self.rel, attno, tid, undo_ptr)
    }

    pub fn undo_item_deletion(&self, attno: u16, tid: Tid, undo_ptr: UndoPtr) -> Result<()> {
        self.check_attno(attno)?;
        ops::undo_item_deletion(&self.rel, attno, tid, undo_ptr)
    }

    /// Advances the UNDO horizon (monotone) and recycles dead UNDO pages.
    pub fn trim_undo(&self, horizon: UndoPtr) -> Result<()> {
        self.rel.undo.trim(horizon)
    }

    // Row-level orchestration.

    /// Inserts full rows; each row is one `Option` datum per data
    /// attribute (`None` for null). Returns the assigned TIDs.
    pub fn insert_rows(
        &self,
        rows: &[Vec<Option<Vec<u8>>>],
        xid: Xid,
        cid: Cid,
    ) -> Result<Vec<Tid>> {
        let n = rows.len();
        if n == 0 {
            return Ok(Vec::new());
        }
        let width = self.nattrs() as usize;
        if rows.iter().any(|row| row.len() != width) {
            return Err(ZedError::Invalid("row width does not match the table"));
        }

        // the meta-attribute assigns TIDs and mints the one UNDO record
        let mut tids = vec![Tid::INVALID; n];
        let mut undo_ptr = UndoPtr::INVALID;
        let meta_datums: Vec<&[u8]> = vec![b""; n];
        let meta_isnulls = vec![false; n];
        self.multi_insert(
            META_ATTNO,
            &meta_datums,
            &meta_isnulls,
            &mut tids,
            xid,
            cid,
            &mut undo_ptr,
        )?;

        for attno in 1..=width as u16 {
            let col = attno as usize - 1;
            let datums: Vec<&[u8]> = rows
                .iter()
                .map(|row| row[col].as_deref().unwrap_or(b""))
                .collect();
            let isnulls: Vec<bool> = rows.iter().map(|row| row[col].is_none()).collect();
            let mut col_undo = UndoPtr::INVALID;
            self.multi_insert(attno, &datums, &isnulls, &mut tids, xid, cid, &mut col_undo)?;
        }
        Ok(tids)
    }

    /// Deletes a row; visibility lives on the meta-attribute, so data
    /// attributes need no touch until vacuum reclaims them.
    pub fn delete_row(
        &self,
        tid: Tid,
        xid: Xid,
        cid: Cid,
        snapshot: &Snapshot,
    ) -> Result<UpdateOutcome> {
        self.delete(META_ATTNO, tid, xid, cid, snapshot)
    }

    /// Updates a row to a new version with a fresh TID.
    pub fn update_row(
        &self,
        otid: Tid,
        row: &[Option<Vec<u8>>],
        xid: Xid,
        cid: Cid,
        key_update: bool,
        snapshot: &Snapshot,
    ) -> Result<(UpdateOutcome, Tid)> {
        if row.len() != self.nattrs() as usize {
            return Err(ZedError::Invalid("row width does not match the table"));
        }
        let (outcome, new_tid) =
            self.update(META_ATTNO, otid, b"", false, xid, cid, key_update, snapshot)?;
        if !outcome.is_ok() {
            return Ok((outcome, Tid::INVALID));
        }
        for (col, datum) in row.iter().enumerate() {
            let attno = col as u16 + 1;
            let mut tids = [new_tid];
            let mut col_undo = UndoPtr::INVALID;
            self.multi_insert(
                attno,
                &[datum.as_deref().unwrap_or(b"")],
                &[datum.is_none()],
                &mut tids,
                xid,
                cid,
                &mut col_undo,
            )?;
        }
        Ok((UpdateOutcome::Ok, new_tid))
    }

    /// Locks a row via its meta-attribute item.
    pub fn lock_row(
        &self,
        tid: Tid,
        xid: Xid,
        cid: Cid,
        mode: LockMode,
        snapshot: &Snapshot,
    ) -> Result<UpdateOutcome> {
        self.lock_item(META_ATTNO, tid, xid, cid, mode, snapshot)
    }

    /// Scans whole rows over `[start, end)`: the meta-attribute drives
    /// TID order and visibility, the data scans are joined by TID.
    pub fn begin_row_scan(
        &self,
        attnos: &[u16],
        start: Tid,
        end: Tid,
        snapshot: Snapshot,
    ) -> Result<RowScan<'_>> {
        let meta = self.begin_scan(META_ATTNO, start, end, snapshot)?;
        let mut data = Vec::with_capacity(attnos.len());
        for &attno in attnos {
            if attno == META_ATTNO {
                return Err(ZedError::Invalid("row scans select data attributes"));
            }
            data.push(self.begin_scan(attno, start, end, Snapshot::any())?);
        }
        Ok(RowScan { meta, data })
    }
}

/// A multi-attribute scan joined on TID.
pub struct RowScan<'a> {
    meta: TreeScan<'a>,
    data: Vec<TreeScan<'a>>,
}

impl<'a> RowScan<'a> {
    /// The next visible row: its TID and one datum per selected
    /// attribute.
    pub fn next(&mut self) -> Result<Option<(Tid, Vec<Option<Vec<u8>>>)>> {
        let Some((tid, _)) = self.meta.next()? else {
            return Ok(None);
        };
        let mut row = Vec::with_capacity(self.data.len());
        for scan in &mut self.data {
            let datum = scan.fetch(tid)?.ok_or_else(|| {
                ZedError::Corruption(format!("attribute tree has no tuple for {tid}"))
            })?;
            row.push(datum);
        }
        Ok(Some((tid, row)))
    }

    pub fn end(self) {}
}
