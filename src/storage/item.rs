//! Leaf item codec.
//!
//! A leaf page packs items of three kinds, all sharing a `{tid:8, size:2,
//! flags:2}` prefix:
//!
//! * single: one datum, one UNDO pointer;
//! * array: `n` datums with consecutive TIDs sharing one UNDO pointer and
//!   one null flag;
//! * compressed: an opaque container of single and array items, tagged
//!   with the inclusive last TID it covers.
//!
//! Fixed-width datums are packed back to back; variable-width datums are
//! framed with a one-byte header when the datum is 127 bytes or less, and
//! a five-byte header otherwise.

use std::convert::TryFrom;

use crate::error::{Result, ZedError};
use crate::types::{Tid, UndoPtr, MAX_DATUM_SIZE};

pub const ITEM_COMPRESSED: u16 = 0x0001;
pub const ITEM_ARRAY: u16 = 0x0002;
pub const ITEM_NULL: u16 = 0x0010;
pub const ITEM_DEAD: u16 = 0x0020;
pub const ITEM_DELETED: u16 = 0x0040;
pub const ITEM_UPDATED: u16 = 0x0080;

/// Header bytes before the payload of each variant.
pub const SINGLE_HEADER_LEN: usize = 20;
pub const ARRAY_HEADER_LEN: usize = 22;
pub const COMPRESSED_HEADER_LEN: usize = 22;

/// Ceiling on one array item's payload, to bound the cost of rewriting
/// (splitting) it later.
pub const MAX_ARRAY_PAYLOAD: usize = MAX_DATUM_SIZE / 4;

/// Attribute shape as recorded in the metapage root directory. `attlen < 0`
/// means variable width; `attlen == 0` is the payload-free meta attribute.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AttrDesc {
    pub attlen: i16,
    pub attbyval: bool,
}

impl AttrDesc {
    /// The implicit visibility-bearing attribute: no payload at all.
    pub const META: AttrDesc = AttrDesc {
        attlen: 0,
        attbyval: true,
    };

    pub fn varlen(&self) -> bool {
        self.attlen < 0
    }
}

/// An owned single or array item. `nelements == 1` encodes as a single
/// item, anything larger as an array item.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UncompressedItem {
    pub tid: Tid,
    pub flags: u16,
    pub nelements: u16,
    pub undo: UndoPtr,
    pub payload: Vec<u8>,
}

impl UncompressedItem {
    pub fn single(tid: Tid, undo: UndoPtr, datum: Option<&[u8]>) -> UncompressedItem {
        let (flags, payload) = match datum {
            Some(bytes) => (0, bytes.to_vec()),
            None => (ITEM_NULL, Vec::new()),
        };
        UncompressedItem {
            tid,
            flags,
            nelements: 1,
            undo,
            payload,
        }
    }

    /// A size-zero tombstone holding the TID until the UNDO horizon passes.
    pub fn tombstone(tid: Tid, undo: UndoPtr) -> UncompressedItem {
        UncompressedItem {
            tid,
            flags: ITEM_DEAD,
            nelements: 1,
            undo,
            payload: Vec::new(),
        }
    }

    pub fn last_tid(&self) -> Tid {
        Tid(self.tid.0 + u64::from(self.nelements) - 1)
    }

    pub fn covers(&self, tid: Tid) -> bool {
        self.tid <= tid && tid <= self.last_tid()
    }

    pub fn is_null(&self) -> bool {
        self.flags & ITEM_NULL != 0
    }

    pub fn is_dead(&self) -> bool {
        self.flags & ITEM_DEAD != 0
    }

    pub fn encoded_len(&self) -> usize {
        if self.nelements == 1 {
            SINGLE_HEADER_LEN + self.payload.len()
        } else {
            ARRAY_HEADER_LEN + self.payload.len()
        }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let size = u16::try_from(self.encoded_len()).expect("leaf item exceeds page size");
        out.extend_from_slice(&self.tid.0.to_be_bytes());
        out.extend_from_slice(&size.to_be_bytes());
        if self.nelements == 1 {
            let flags = self.flags & !ITEM_ARRAY;
            out.extend_from_slice(&flags.to_be_bytes());
            out.extend_from_slice(&self.undo.0.to_be_bytes());
        } else {
            let flags = self.flags | ITEM_ARRAY;
            out.extend_from_slice(&flags.to_be_bytes());
            out.extend_from_slice(&self.nelements.to_be_bytes());
            out.extend_from_slice(&self.undo.0.to_be_bytes());
        }
        out.extend_from_slice(&self.payload);
    }

    /// Byte bounds of each element within the payload. A single item's
    /// payload is the bare datum (its length comes from the item header);
    /// array payloads frame variable-width datums individually.
    fn element_bounds(&self, attr: &AttrDesc) -> Result<Vec<(usize, usize)>> {
        let n = self.nelements as usize;
        if self.is_null() {
            return Ok(vec![(0, 0); n]);
        }
        if n == 1 {
            return Ok(vec![(0, self.payload.len())]);
        }
        let mut bounds = Vec::with_capacity(n);
        if attr.varlen() {
            let mut pos = 0;
            for _ in 0..n {
                let (datum, consumed) = decode_datum_at(&self.payload, pos)?;
                let start = pos + consumed - datum.len();
                bounds.push((start, start + datum.len()));
                pos += consumed;
            }
            if pos != self.payload.len() {
                return Err(ZedError::Corruption("array payload has trailing bytes".into()));
            }
        } else {
            let width = self.attr_width(attr)?;
            if self.payload.len() != width * n {
                return Err(ZedError::Corruption("array payload length mismatch".into()));
            }
            for i in 0..n {
                bounds.push((i * width, (i + 1) * width));
            }
        }
        Ok(bounds)
    }

    fn attr_width(&self, attr: &AttrDesc) -> Result<usize> {
        usize::try_from(attr.attlen).map_err(|_| ZedError::Invalid("fixed width out of range"))
    }

    /// Iterates `(tid, datum)` pairs; `None` datum means SQL null.
    pub fn elements<'a>(&'a self, attr: &AttrDesc) -> Result<ElementIter<'a>> {
        Ok(ElementIter {
            item: self,
            bounds: self.element_bounds(attr)?,
            idx: 0,
        })
    }

    /// Builds a sub-item covering `count` elements starting at `start_idx`,
    /// sharing this item's flags and UNDO pointer.
    pub fn slice_elements(
        &self,
        attr: &AttrDesc,
        start_idx: usize,
        count: usize,
    ) -> Result<UncompressedItem> {
        let n = self.nelements as usize;
        if count == 0 || start_idx + count > n {
            return Err(ZedError::Invalid("element slice out of range"));
        }
        if count == 1 {
            return self.extract_single(attr, Tid(self.tid.0 + start_idx as u64));
        }
        let payload = if self.is_null() {
            Vec::new()
        } else {
            let bounds = self.element_bounds(attr)?;
            let first = bounds[start_idx];
            let last = bounds[start_idx + count - 1];
            // keep the varlena frames, so widen the first bound to the
            // start of its header
            let start = if attr.varlen() && start_idx > 0 {
                bounds[start_idx - 1].1
            } else if attr.varlen() {
                0
            } else {
                first.0
            };
            self.payload[start..last.1].to_vec()
        };
        Ok(UncompressedItem {
            tid: Tid(self.tid.0 + start_idx as u64),
            flags: self.flags,
            nelements: count as u16,
            undo: self.undo,
            payload,
        })
    }

    /// Extracts one element as a single item (used to build replacements
    /// when a mutation targets one TID inside an array).
    pub fn extract_single(&self, attr: &AttrDesc, tid: Tid) -> Result<UncompressedItem> {
        if !self.covers(tid) {
            return Err(ZedError::Invalid("TID not covered by item"));
        }
        let idx = (tid.0 - self.tid.0) as usize;
        if self.is_null() {
            return Ok(UncompressedItem {
                tid,
                flags: self.flags,
                nelements: 1,
                undo: self.undo,
                payload: Vec::new(),
            });
        }
        let bounds = self.element_bounds(attr)?;
        let (start, end) = bounds[idx];
        Ok(UncompressedItem {
            tid,
            flags: self.flags,
            nelements: 1,
            undo: self.undo,
            payload: self.payload[start..end].to_vec(),
        })
    }
}

pub struct ElementIter<'a> {
    item: &'a UncompressedItem,
    bounds: Vec<(usize, usize)>,
    idx: usize,
}

impl<'a> Iterator for ElementIter<'a> {
    type Item = (Tid, Option<&'a [u8]>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.idx >= self.bounds.len() {
            return None;
        }
        let tid = Tid(self.item.tid.0 + self.idx as u64);
        let datum = if self.item.is_null() {
            None
        } else {
            let (start, end) = self.bounds[self.idx];
            Some(&self.item.payload[start..end])
        };
        self.idx += 1;
        Some((tid, datum))
    }
}

/// An owned compressed container item.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CompressedItem {
    pub tid: Tid,
    pub lasttid: Tid,
    pub uncompressed_size: u16,
    pub payload: Vec<u8>,
}

impl CompressedItem {
    pub fn encoded_len(&self) -> usize {
        COMPRESSED_HEADER_LEN + self.payload.len()
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let size = u16::try_from(self.encoded_len()).expect("compressed item exceeds page size");
        out.extend_from_slice(&self.tid.0.to_be_bytes());
        out.extend_from_slice(&size.to_be_bytes());
        out.extend_from_slice(&ITEM_COMPRESSED.to_be_bytes());
        out.extend_from_slice(&self.uncompressed_size.to_be_bytes());
        out.extend_from_slice(&self.lasttid.0.to_be_bytes());
        out.extend_from_slice(&self.payload);
    }
}

/// Any leaf item.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Item {
    Uncompressed(UncompressedItem),
    Compressed(CompressedItem),
}

impl Item {
    pub fn first_tid(&self) -> Tid {
        match self {
            Item::Uncompressed(item) => item.tid,
            Item::Compressed(item) => item.tid,
        }
    }

    pub fn last_tid(&self) -> Tid {
        match self {
            Item::Uncompressed(item) => item.last_tid(),
            Item::Compressed(item) => item.lasttid,
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Item::Uncompressed(item) => item.encoded_len(),
            Item::Compressed(item) => item.encoded_len(),
        }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Item::Uncompressed(item) => item.encode_into(out),
            Item::Compressed(item) => item.encode_into(out),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out
    }

    /// Decodes a raw on-page item into an owned value.
    pub fn decode(buf: &[u8]) -> Result<Item> {
        if buf.len() < 12 {
            return Err(ZedError::Corruption("leaf item shorter than header".into()));
        }
        let tid = Tid(u64::from_be_bytes(buf[0..8].try_into().unwrap()));
        let size = u16::from_be_bytes(buf[8..10].try_into().unwrap()) as usize;
        let flags = u16::from_be_bytes(buf[10..12].try_into().unwrap());
        if size != buf.len() {
            return Err(ZedError::Corruption("leaf item size mismatch".into()));
        }
        if flags & ITEM_COMPRESSED != 0 {
            if buf.len() < COMPRESSED_HEADER_LEN {
                return Err(ZedError::Corruption("compressed item truncated".into()));
            }
            let uncompressed_size = u16::from_be_bytes(buf[12..14].try_into().unwrap());
            let lasttid = Tid(u64::from_be_bytes(buf[14..22].try_into().unwrap()));
            Ok(Item::Compressed(CompressedItem {
                tid,
                lasttid,
                uncompressed_size,
                payload: buf[COMPRESSED_HEADER_LEN..].to_vec(),
            }))
        } else if flags & ITEM_ARRAY != 0 {
            if buf.len() < ARRAY_HEADER_LEN {
                return Err(ZedError::Corruption("array item truncated".into()));
            }
            let nelements = u16::from_be_bytes(buf[12..14].try_into().unwrap());
            if nelements == 0 {
                return Err(ZedError::Corruption("array item with zero elements".into()));
            }
            let undo = UndoPtr(u64::from_be_bytes(buf[14..22].try_into().unwrap()));
            Ok(Item::Uncompressed(UncompressedItem {
                tid,
                flags,
                nelements,
                undo,
                payload: buf[ARRAY_HEADER_LEN..].to_vec(),
            }))
        } else {
            if buf.len() < SINGLE_HEADER_LEN {
                return Err(ZedError::Corruption("single item truncated".into()));
            }
            let undo = UndoPtr(u64::from_be_bytes(buf[12..20].try_into().unwrap()));
            Ok(Item::Uncompressed(UncompressedItem {
                tid,
                flags,
                nelements: 1,
                undo,
                payload: buf[SINGLE_HEADER_LEN..].to_vec(),
            }))
        }
    }
}

/// Reads just the covered TID range off a raw item, without copying it.
pub fn peek_tid_range(buf: &[u8]) -> Result<(Tid, Tid)> {
    if buf.len() < 12 {
        return Err(ZedError::Corruption("leaf item shorter than header".into()));
    }
    let tid = Tid(u64::from_be_bytes(buf[0..8].try_into().unwrap()));
    let flags = u16::from_be_bytes(buf[10..12].try_into().unwrap());
    let last = if flags & ITEM_COMPRESSED != 0 {
        if buf.len() < COMPRESSED_HEADER_LEN {
            return Err(ZedError::Corruption("compressed item truncated".into()));
        }
        Tid(u64::from_be_bytes(buf[14..22].try_into().unwrap()))
    } else if flags & ITEM_ARRAY != 0 {
        if buf.len() < ARRAY_HEADER_LEN {
            return Err(ZedError::Corruption("array item truncated".into()));
        }
        let n = u16::from_be_bytes(buf[12..14].try_into().unwrap());
        Tid(tid.0 + u64::from(n) - 1)
    } else {
        tid
    };
    Ok((tid, last))
}

fn encode_datum(attr: &AttrDesc, datum: &[u8], out: &mut Vec<u8>) -> Result<()> {
    if attr.varlen() {
        if datum.len() <= 0x7F {
            out.push(((datum.len() as u8) << 1) | 1);
        } else {
            let len = u32::try_from(datum.len())
                .map_err(|_| ZedError::Invalid("datum length exceeds u32"))?;
            out.push(0);
            out.extend_from_slice(&len.to_be_bytes());
        }
        out.extend_from_slice(datum);
    } else {
        let width = usize::try_from(attr.attlen)
            .map_err(|_| ZedError::Invalid("fixed width out of range"))?;
        if datum.len() != width {
            return Err(ZedError::Invalid("datum length does not match attribute"));
        }
        out.extend_from_slice(datum);
    }
    Ok(())
}

fn encoded_datum_len(attr: &AttrDesc, datum: &[u8]) -> usize {
    if attr.varlen() {
        let header = if datum.len() <= 0x7F { 1 } else { 5 };
        header + datum.len()
    } else {
        datum.len()
    }
}

fn decode_datum_at(payload: &[u8], pos: usize) -> Result<(&[u8], usize)> {
    let buf = payload
        .get(pos..)
        .ok_or_else(|| ZedError::Corruption("varlena header beyond payload".into()))?;
    if buf.is_empty() {
        return Err(ZedError::Corruption("varlena header beyond payload".into()));
    }
    let (len, header) = if buf[0] & 1 == 1 {
        ((buf[0] >> 1) as usize, 1)
    } else {
        if buf.len() < 5 {
            return Err(ZedError::Corruption("varlena long header truncated".into()));
        }
        (
            u32::from_be_bytes(buf[1..5].try_into().unwrap()) as usize,
            5,
        )
    };
    let end = header + len;
    if buf.len() < end {
        return Err(ZedError::Corruption("varlena datum truncated".into()));
    }
    Ok((&buf[header..end], end))
}

/// Packs `(tid, datum)` runs into single and array items sharing `undo`.
///
/// Runs break on non-consecutive TIDs, a change in nullness, or the array
/// payload cap; a lone datum becomes a single item, which may use the full
/// `MAX_DATUM_SIZE`.
pub fn create_items(
    attr: &AttrDesc,
    tids: &[Tid],
    datums: &[&[u8]],
    isnulls: &[bool],
    undo: UndoPtr,
) -> Result<Vec<UncompressedItem>> {
    if tids.len() != datums.len() || tids.len() != isnulls.len() {
        return Err(ZedError::Invalid("mismatched insert array lengths"));
    }
    let mut items: Vec<UncompressedItem> = Vec::new();
    let mut run_start = 0;
    let mut run_payload: Vec<u8> = Vec::new();

    let flush = |items: &mut Vec<UncompressedItem>,
                 start: usize,
                 end: usize,
                 payload: &mut Vec<u8>| {
        if end == start {
            return;
        }
        let flags = if isnulls[start] { ITEM_NULL } else { 0 };
        // a lone varlen datum loses its frame; single-item payloads are bare
        let payload = if end - start == 1 && !isnulls[start] && attr.varlen() {
            payload.clear();
            datums[start].to_vec()
        } else {
            std::mem::take(payload)
        };
        items.push(UncompressedItem {
            tid: tids[start],
            flags,
            nelements: (end - start) as u16,
            undo,
            payload,
        });
    };

    for i in 0..tids.len() {
        if !tids[i].is_valid() {
            return Err(ZedError::Invalid("cannot encode an invalid TID"));
        }
        let datum_len = if isnulls[i] {
            0
        } else {
            encoded_datum_len(attr, datums[i])
        };
        if !isnulls[i] && datum_len > MAX_DATUM_SIZE {
            return Err(ZedError::Invalid("datum too large; externalize it first"));
        }
        let breaks_run = i > run_start
            && (tids[i] != tids[i - 1].next()
                || isnulls[i] != isnulls[run_start]
                || run_payload.len() + datum_len > MAX_ARRAY_PAYLOAD
                || i - run_start >= u16::MAX as usize);
        if breaks_run {
            flush(&mut items, run_start, i, &mut run_payload);
            run_start = i;
        }
        if !isnulls[i] {
            encode_datum(attr, datums[i], &mut run_payload)?;
        }
    }
    flush(&mut items, run_start, tids.len(), &mut run_payload);
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARLEN: AttrDesc = AttrDesc {
        attlen: -1,
        attbyval: false,
    };
    const FIXED8: AttrDesc = AttrDesc {
        attlen: 8,
        attbyval: true,
    };

    #[test]
    fn single_item_roundtrip() -> Result<()> {
        let item = UncompressedItem::single(Tid(42), UndoPtr(7), Some(b"payload"));
        let encoded = Item::Uncompressed(item.clone()).encode();
        assert_eq!(encoded.len(), item.encoded_len());
        match Item::decode(&encoded)? {
            Item::Uncompressed(decoded) => assert_eq!(decoded, item),
            _ => panic!("expected uncompressed item"),
        }
        Ok(())
    }

    #[test]
    fn array_item_roundtrip() -> Result<()> {
        let tids: Vec<Tid> = (10..14).map(Tid).collect();
        let datums: Vec<&[u8]> = vec![b"aaaaaaaa", b"bbbbbbbb", b"cccccccc", b"dddddddd"];
        let isnulls = vec![false; 4];
        let items = create_items(&FIXED8, &tids, &datums, &isnulls, UndoPtr(3))?;
        assert_eq!(items.len(), 1);
        let encoded = Item::Uncompressed(items[0].clone()).encode();
        match Item::decode(&encoded)? {
            Item::Uncompressed(decoded) => {
                assert_eq!(decoded.nelements, 4);
                assert_eq!(decoded.last_tid(), Tid(13));
                let elements: Vec<_> = decoded.elements(&FIXED8)?.collect();
                assert_eq!(elements[2], (Tid(12), Some(&b"cccccccc"[..])));
            }
            _ => panic!("expected array item"),
        }
        Ok(())
    }

    #[test]
    fn compressed_item_roundtrip() -> Result<()> {
        let item = CompressedItem {
            tid: Tid(1),
            lasttid: Tid(99),
            uncompressed_size: 500,
            payload: vec![0xAB; 64],
        };
        let encoded = Item::Compressed(item.clone()).encode();
        assert_eq!(peek_tid_range(&encoded)?, (Tid(1), Tid(99)));
        match Item::decode(&encoded)? {
            Item::Compressed(decoded) => assert_eq!(decoded, item),
            _ => panic!("expected compressed item"),
        }
        Ok(())
    }

    #[test]
    fn varlena_header_boundary() -> Result<()> {
        for len in [0usize, 1, 127, 128, 300] {
            let datum = vec![0x5A; len];
            let tids = [Tid(5)];
            let datums: Vec<&[u8]> = vec![&datum];
            let items = create_items(&VARLEN, &tids, &datums, &[false], UndoPtr::INVALID)?;
            let got: Vec<_> = items[0].elements(&VARLEN)?.collect();
            assert_eq!(got, vec![(Tid(5), Some(&datum[..]))]);
        }
        Ok(())
    }

    #[test]
    fn runs_break_on_gaps_and_nulls() -> Result<()> {
        let tids: Vec<Tid> = vec![Tid(1), Tid(2), Tid(4), Tid(5), Tid(6)];
        let datums: Vec<&[u8]> = vec![b"11111111"; 5];
        let isnulls = vec![false, false, false, true, false];
        let items = create_items(&FIXED8, &tids, &datums, &isnulls, UndoPtr::INVALID)?;
        // [1,2] | gap | [4] | null [5] | [6]
        assert_eq!(items.len(), 4);
        assert_eq!(items[0].nelements, 2);
        assert_eq!(items[1].tid, Tid(4));
        assert!(items[2].is_null());
        assert_eq!(items[3].tid, Tid(6));
        Ok(())
    }

    #[test]
    fn runs_break_on_payload_cap() -> Result<()> {
        let datum = vec![1u8; 1000];
        let n = 10;
        let tids: Vec<Tid> = (1..=n).map(Tid).collect();
        let datums: Vec<&[u8]> = vec![&datum; n as usize];
        let isnulls = vec![false; n as usize];
        let attr = AttrDesc {
            attlen: 1000,
            attbyval: false,
        };
        let items = create_items(&attr, &tids, &datums, &isnulls, UndoPtr::INVALID)?;
        assert!(items.len() > 1);
        for item in &items {
            assert!(item.payload.len() <= MAX_ARRAY_PAYLOAD);
        }
        let total: u64 = items.iter().map(|i| u64::from(i.nelements)).sum();
        assert_eq!(total, n);
        Ok(())
    }

    #[test]
    fn meta_attribute_items_have_no_payload() -> Result<()> {
        let tids: Vec<Tid> = (1..=100).map(Tid).collect();
        let datums: Vec<&[u8]> = vec![b""; 100];
        let isnulls = vec![false; 100];
        let items = create_items(&AttrDesc::META, &tids, &datums, &isnulls, UndoPtr(9))?;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].nelements, 100);
        assert!(items[0].payload.is_empty());
        Ok(())
    }

    #[test]
    fn slice_and_extract_preserve_elements() -> Result<()> {
        let datums: Vec<Vec<u8>> = (0..6u8).map(|i| vec![i; (i as usize % 3) + 1]).collect();
        let datum_refs: Vec<&[u8]> = datums.iter().map(|d| d.as_slice()).collect();
        let tids: Vec<Tid> = (20..26).map(Tid).collect();
        let items = create_items(&VARLEN, &tids, &datum_refs, &[false; 6], UndoPtr(1))?;
        assert_eq!(items.len(), 1);
        let item = &items[0];

        let right = item.slice_elements(&VARLEN, 3, 3)?;
        assert_eq!(right.tid, Tid(23));
        let got: Vec<_> = right.elements(&VARLEN)?.map(|(_, d)| d.unwrap().to_vec()).collect();
        assert_eq!(got, datums[3..6].to_vec());

        let one = item.extract_single(&VARLEN, Tid(22))?;
        assert_eq!(one.nelements, 1);
        assert_eq!(one.payload, datums[2]);
        Ok(())
    }

    #[test]
    fn tombstone_is_dead_and_empty() {
        let item = UncompressedItem::tombstone(Tid(7), UndoPtr(5));
        assert!(item.is_dead());
        assert!(item.payload.is_empty());
        let encoded = Item::Uncompressed(item).encode();
        assert_eq!(encoded.len(), SINGLE_HEADER_LEN);
    }
}
