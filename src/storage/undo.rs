//! Append-only UNDO log.
//!
//! Visibility records live on dedicated UNDO pages chained head to tail
//! through the metapage opaque area. A record is addressed by a bare
//! monotonic counter; each UNDO page remembers the counter of its first
//! record, and the log keeps an in-memory `(first_counter, block)` index
//! (rebuilt on open by walking the chain) so a fetch is one page lookup
//! plus an in-page walk.
//!
//! Records for one row chain together through `prev` pointers; the log
//! itself never interprets the chain.

use std::convert::TryFrom;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Result, ZedError};
use crate::primitives::pager::Pager;
use crate::storage::page;
use crate::storage::txn::LockMode;
use crate::types::{BlockNumber, Cid, Tid, UndoPtr, Xid, INVALID_BLOCK, META_BLOCK};

pub const UNDO_TYPE_INSERT: u16 = 1;
pub const UNDO_TYPE_DELETE: u16 = 2;
pub const UNDO_TYPE_UPDATE: u16 = 3;
pub const UNDO_TYPE_TUPLE_LOCK: u16 = 4;

/// Common record header: `{size:2, type:2, xid:4, cid:4, tid:8}`.
const REC_HEADER_LEN: usize = 20;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UndoPayload {
    Insert { endtid: Tid },
    Delete { prev: UndoPtr },
    Update {
        prev: UndoPtr,
        newtid: Tid,
        key_update: bool,
    },
    TupleLock { prev: UndoPtr, mode: LockMode },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UndoRec {
    pub xid: Xid,
    pub cid: Cid,
    pub tid: Tid,
    pub payload: UndoPayload,
}

impl UndoRec {
    /// The previous record in this row's chain, if the variant has one.
    pub fn prev(&self) -> UndoPtr {
        match self.payload {
            UndoPayload::Insert { .. } => UndoPtr::INVALID,
            UndoPayload::Delete { prev } => prev,
            UndoPayload::Update { prev, .. } => prev,
            UndoPayload::TupleLock { prev, .. } => prev,
        }
    }

    fn type_tag(&self) -> u16 {
        match self.payload {
            UndoPayload::Insert { .. } => UNDO_TYPE_INSERT,
            UndoPayload::Delete { .. } => UNDO_TYPE_DELETE,
            UndoPayload::Update { .. } => UNDO_TYPE_UPDATE,
            UndoPayload::TupleLock { .. } => UNDO_TYPE_TUPLE_LOCK,
        }
    }

    fn encoded_len(&self) -> usize {
        REC_HEADER_LEN
            + match self.payload {
                UndoPayload::Insert { .. } => 8,
                UndoPayload::Delete { .. } => 8,
                UndoPayload::Update { .. } => 17,
                UndoPayload::TupleLock { .. } => 9,
            }
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        let size = u16::try_from(self.encoded_len()).expect("undo record is small");
        out.extend_from_slice(&size.to_be_bytes());
        out.extend_from_slice(&self.type_tag().to_be_bytes());
        out.extend_from_slice(&self.xid.0.to_be_bytes());
        out.extend_from_slice(&self.cid.0.to_be_bytes());
        out.extend_from_slice(&self.tid.0.to_be_bytes());
        match &self.payload {
            UndoPayload::Insert { endtid } => out.extend_from_slice(&endtid.0.to_be_bytes()),
            UndoPayload::Delete { prev } => out.extend_from_slice(&prev.0.to_be_bytes()),
            UndoPayload::Update {
                prev,
                newtid,
                key_update,
            } => {
                out.extend_from_slice(&prev.0.to_be_bytes());
                out.extend_from_slice(&newtid.0.to_be_bytes());
                out.push(u8::from(*key_update));
            }
            UndoPayload::TupleLock { prev, mode } => {
                out.extend_from_slice(&prev.0.to_be_bytes());
                out.push(mode.as_u8());
            }
        }
        debug_assert_eq!(out.len(), self.encoded_len());
        out
    }

    fn decode(buf: &[u8]) -> Result<(UndoRec, usize)> {
        if buf.len() < REC_HEADER_LEN {
            return Err(ZedError::Corruption("undo record truncated".into()));
        }
        let size = u16::from_be_bytes(buf[0..2].try_into().unwrap()) as usize;
        let tag = u16::from_be_bytes(buf[2..4].try_into().unwrap());
        if size < REC_HEADER_LEN || size > buf.len() {
            return Err(ZedError::Corruption("undo record size out of range".into()));
        }
        let xid = Xid(u32::from_be_bytes(buf[4..8].try_into().unwrap()));
        let cid = Cid(u32::from_be_bytes(buf[8..12].try_into().unwrap()));
        let tid = Tid(u64::from_be_bytes(buf[12..20].try_into().unwrap()));
        let body = &buf[REC_HEADER_LEN..size];
        let read_ptr = |at: usize| UndoPtr(u64::from_be_bytes(body[at..at + 8].try_into().unwrap()));
        let payload = match tag {
            UNDO_TYPE_INSERT if body.len() == 8 => UndoPayload::Insert {
                endtid: Tid(u64::from_be_bytes(body[0..8].try_into().unwrap())),
            },
            UNDO_TYPE_DELETE if body.len() == 8 => UndoPayload::Delete { prev: read_ptr(0) },
            UNDO_TYPE_UPDATE if body.len() == 17 => UndoPayload::Update {
                prev: read_ptr(0),
                newtid: Tid(u64::from_be_bytes(body[8..16].try_into().unwrap())),
                key_update: body[16] != 0,
            },
            UNDO_TYPE_TUPLE_LOCK if body.len() == 9 => UndoPayload::TupleLock {
                prev: read_ptr(0),
                mode: LockMode::from_u8(body[8])
                    .ok_or_else(|| ZedError::Corruption("bad lock mode in undo record".into()))?,
            },
            _ => {
                return Err(ZedError::Corruption(format!(
                    "unexpected undo record type {tag}"
                )))
            }
        };
        Ok((
            UndoRec {
                xid,
                cid,
                tid,
                payload,
            },
            size,
        ))
    }
}

/// The UNDO log of one table.
pub struct UndoLog {
    pager: Arc<Pager>,
    /// `(first_counter, block)` for every live UNDO page, in chain order.
    index: Mutex<Vec<(u64, BlockNumber)>>,
}

impl UndoLog {
    /// For a freshly initialized table with no UNDO pages yet.
    pub fn new(pager: Arc<Pager>) -> UndoLog {
        UndoLog {
            pager,
            index: Mutex::new(Vec::new()),
        }
    }

    /// Rebuilds the page index of an existing table by walking the chain.
    pub fn open(pager: Arc<Pager>) -> Result<UndoLog> {
        let mut index = Vec::new();
        let meta_pin = pager.pin(META_BLOCK)?;
        let head = {
            let guard = meta_pin.read();
            page::meta_opaque(&guard)?.undo_head
        };
        let mut blk = head;
        while blk != INVALID_BLOCK {
            let pin = pager.pin(blk)?;
            let guard = pin.read();
            let opaque = page::undo_opaque(&guard)?;
            if let Some((last, _)) = index.last() {
                if opaque.first_counter <= *last {
                    return Err(ZedError::corrupt_at(blk, "undo chain counters not increasing"));
                }
            }
            index.push((opaque.first_counter, blk));
            if opaque.next == blk {
                return Err(ZedError::corrupt_at(blk, "undo page links to itself"));
            }
            blk = opaque.next;
        }
        drop(meta_pin);
        Ok(UndoLog {
            pager,
            index: Mutex::new(index),
        })
    }

    /// Appends `rec`, assigning it the next counter. Counter assignment is
    /// serialized on the metapage lock, so a pointer handed out here is
    /// strictly greater than any pointer a concurrent reader has seen.
    pub fn insert(&self, rec: &UndoRec) -> Result<UndoPtr> {
        let encoded = rec.encode();
        let meta_pin = self.pager.pin(META_BLOCK)?;
        let mut meta_guard = meta_pin.write();
        let mut opaque = page::meta_opaque(&meta_guard)?;
        let counter = opaque.undo_counter;

        let mut tail_blk = opaque.undo_tail;
        let mut tail = if tail_blk == INVALID_BLOCK {
            None
        } else {
            let pin = self.pager.pin(tail_blk)?;
            let guard = pin.write();
            if page::body_free(&guard) < encoded.len() {
                None
            } else {
                Some(guard)
            }
        };
        if tail.is_none() {
            let (new_pin, new_blk) = self.pager.new_page()?;
            let mut new_guard = new_pin.write();
            page::init_undo_page(
                &mut new_guard,
                &page::UndoOpaque {
                    first_counter: counter,
                    next: INVALID_BLOCK,
                    prev: opaque.undo_tail,
                    flags: 0,
                },
            );
            if opaque.undo_tail != INVALID_BLOCK {
                let old_pin = self.pager.pin(opaque.undo_tail)?;
                let mut old_guard = old_pin.write();
                let mut old_opaque = page::undo_opaque(&old_guard)?;
                old_opaque.next = new_blk;
                page::write_undo_opaque(&mut old_guard, &old_opaque);
                old_guard.mark_dirty();
            }
            if opaque.undo_head == INVALID_BLOCK {
                opaque.undo_head = new_blk;
            }
            opaque.undo_tail = new_blk;
            self.index.lock().push((counter, new_blk));
            tail_blk = new_blk;
            tail = Some(new_guard);
        }

        let mut tail_guard = tail.expect("tail page prepared above");
        page::body_append(&mut tail_guard, &encoded)
            .map_err(|_| ZedError::corrupt_at(tail_blk, "undo record does not fit"))?;
        tail_guard.mark_dirty();
        drop(tail_guard);

        opaque.undo_counter = counter + 1;
        page::write_meta_opaque(&mut meta_guard, &opaque);
        meta_guard.mark_dirty();
        Ok(UndoPtr(counter))
    }

    /// Fetches the record at `ptr`; `None` when the pointer has fallen
    /// behind the oldest-live horizon.
    pub fn fetch(&self, ptr: UndoPtr) -> Result<Option<UndoRec>> {
        let (oldest, next_counter) = {
            let meta_pin = self.pager.pin(META_BLOCK)?;
            let guard = meta_pin.read();
            let opaque = page::meta_opaque(&guard)?;
            (opaque.undo_oldest, opaque.undo_counter)
        };
        if ptr < oldest {
            return Ok(None);
        }
        if ptr.0 >= next_counter {
            return Err(ZedError::Corruption(format!(
                "undo pointer {ptr} has not been assigned yet"
            )));
        }
        let blk = {
            let index = self.index.lock();
            let pos = index.partition_point(|(first, _)| *first <= ptr.0);
            if pos == 0 {
                return Err(ZedError::Corruption(format!(
                    "no undo page covers pointer {ptr}"
                )));
            }
            index[pos - 1].1
        };
        let pin = self.pager.pin(blk)?;
        let guard = pin.read();
        let opaque = page::undo_opaque(&guard)?;
        let mut body = page::body(&guard);
        let mut counter = opaque.first_counter;
        while !body.is_empty() {
            let (rec, size) = UndoRec::decode(body)?;
            if counter == ptr.0 {
                return Ok(Some(rec));
            }
            counter += 1;
            body = &body[size..];
        }
        Err(ZedError::corrupt_at(blk, "undo pointer missing from its page"))
    }

    /// The pointer below which no reader can observe records.
    pub fn oldest_live(&self) -> Result<UndoPtr> {
        let meta_pin = self.pager.pin(META_BLOCK)?;
        let guard = meta_pin.read();
        Ok(page::meta_opaque(&guard)?.undo_oldest)
    }

    /// Advances the oldest-live pointer to `horizon` (monotone) and
    /// recycles UNDO pages that fell wholly behind it.
    pub fn trim(&self, horizon: UndoPtr) -> Result<()> {
        let meta_pin = self.pager.pin(META_BLOCK)?;
        let mut meta_guard = meta_pin.write();
        let mut opaque = page::meta_opaque(&meta_guard)?;
        if horizon > opaque.undo_oldest {
            opaque.undo_oldest = horizon;
        }
        while opaque.undo_head != INVALID_BLOCK {
            let head_blk = opaque.undo_head;
            let (next, next_first) = {
                let pin = self.pager.pin(head_blk)?;
                let guard = pin.read();
                let head_opaque = page::undo_opaque(&guard)?;
                if head_opaque.next == INVALID_BLOCK {
                    // the tail page's records run up to the current counter
                    (INVALID_BLOCK, opaque.undo_counter)
                } else {
                    let next_pin = self.pager.pin(head_opaque.next)?;
                    let next_guard = next_pin.read();
                    (head_opaque.next, page::undo_opaque(&next_guard)?.first_counter)
                }
            };
            if next_first > opaque.undo_oldest.0 {
                break;
            }
            opaque.undo_head = next;
            if next == INVALID_BLOCK {
                opaque.undo_tail = INVALID_BLOCK;
            } else {
                let next_pin = self.pager.pin(next)?;
                let mut next_guard = next_pin.write();
                let mut next_opaque = page::undo_opaque(&next_guard)?;
                next_opaque.prev = INVALID_BLOCK;
                page::write_undo_opaque(&mut next_guard, &next_opaque);
                next_guard.mark_dirty();
            }
            {
                let mut index = self.index.lock();
                index.retain(|(_, blk)| *blk != head_blk);
            }
            debug!(block = head_blk, "recycling trimmed undo page");
            if let Err(err) = self.pager.free_page(head_blk) {
                debug!(block = head_blk, %err, "undo page still pinned; leaving it allocated");
            }
        }
        page::write_meta_opaque(&mut meta_guard, &opaque);
        meta_guard.mark_dirty();
        Ok(())
    }
}
