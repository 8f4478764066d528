//! On-disk page layout.
//!
//! Every page starts with a fixed 24-byte header and ends with an "opaque"
//! area whose last two bytes tag the page kind. Between them, tree leaf
//! pages use a slotted layout (an item-pointer array growing up from the
//! header, item data growing down from the opaque area), while internal
//! pages, the metapage and UNDO pages pack their body as a plain array
//! ending at `lower`.

use std::convert::TryFrom;
use std::ops::Range;

use crate::error::{Result, ZedError};
use crate::types::{
    BlockNumber, Tid, UndoPtr, BTREE_PAGE_ID, META_PAGE_ID, PAGE_HDR_LEN, PAGE_SIZE, UNDO_PAGE_ID,
};

const HDR_LSN: Range<usize> = 0..8;
const HDR_CHECKSUM: Range<usize> = 8..12;
const HDR_FLAGS: Range<usize> = 12..14;
const HDR_LOWER: Range<usize> = 14..16;
const HDR_UPPER: Range<usize> = 16..18;
const HDR_SPECIAL: Range<usize> = 18..20;
const HDR_VERSION: Range<usize> = 20..22;
const HDR_RESERVED: Range<usize> = 22..24;

/// Current page format version stamped into every header.
pub const PAGE_FORMAT_VERSION: u16 = 1;

/// Size of one entry in the item-pointer array (`offset:u16, len:u16`).
pub const ITEM_PTR_LEN: usize = 4;

/// Tree page opaque layout: `{attno:2, next:4, lokey:8, hikey:8, level:2,
/// flags:2, pad:2, page_id:2}`.
pub const TREE_OPAQUE_LEN: usize = 28;

/// Metapage opaque layout: `{undo_counter:8, undo_head:4, undo_tail:4,
/// undo_oldest:8, flags:2, page_id:2}`.
pub const META_OPAQUE_LEN: usize = 28;

/// UNDO page opaque layout: `{first_counter:8, next:4, prev:4, flags:2,
/// pad:4, page_id:2}`.
pub const UNDO_OPAQUE_LEN: usize = 24;

/// Tree page flag: this page is the current root of its attribute tree.
pub const TREE_FLAG_ROOT: u16 = 0x0001;

/// Tree page flag: a split left this page without a parent downlink; the
/// right sibling holds keys at or above `hikey` until the downlink lands.
pub const TREE_FLAG_FOLLOW_RIGHT: u16 = 0x0002;

fn read_u16(page: &[u8], range: Range<usize>) -> u16 {
    u16::from_be_bytes(page[range].try_into().unwrap())
}

fn write_u16(page: &mut [u8], range: Range<usize>, value: u16) {
    page[range].copy_from_slice(&value.to_be_bytes());
}

fn read_u32_at(page: &[u8], off: usize) -> u32 {
    u32::from_be_bytes(page[off..off + 4].try_into().unwrap())
}

fn write_u32_at(page: &mut [u8], off: usize, value: u32) {
    page[off..off + 4].copy_from_slice(&value.to_be_bytes());
}

fn read_u64_at(page: &[u8], off: usize) -> u64 {
    u64::from_be_bytes(page[off..off + 8].try_into().unwrap())
}

fn write_u64_at(page: &mut [u8], off: usize, value: u64) {
    page[off..off + 8].copy_from_slice(&value.to_be_bytes());
}

/// Formats `page` as an empty page reserving `opaque_len` tail bytes.
pub fn init(page: &mut [u8], opaque_len: usize) {
    debug_assert_eq!(page.len(), PAGE_SIZE);
    page.fill(0);
    let special = PAGE_SIZE - opaque_len;
    write_u16(page, HDR_LOWER, PAGE_HDR_LEN as u16);
    write_u16(page, HDR_UPPER, special as u16);
    write_u16(page, HDR_SPECIAL, special as u16);
    write_u16(page, HDR_VERSION, PAGE_FORMAT_VERSION);
    write_u16(page, HDR_RESERVED, 0);
    page[HDR_LSN].fill(0);
    page[HDR_CHECKSUM].fill(0);
    page[HDR_FLAGS].fill(0);
}

pub fn lower(page: &[u8]) -> usize {
    read_u16(page, HDR_LOWER) as usize
}

pub fn upper(page: &[u8]) -> usize {
    read_u16(page, HDR_UPPER) as usize
}

pub fn special(page: &[u8]) -> usize {
    read_u16(page, HDR_SPECIAL) as usize
}

pub fn set_lower(page: &mut [u8], value: usize) {
    write_u16(page, HDR_LOWER, value as u16);
}

fn set_upper(page: &mut [u8], value: usize) {
    write_u16(page, HDR_UPPER, value as u16);
}

fn check_bounds(page: &[u8]) -> Result<(usize, usize, usize)> {
    let (lo, up, sp) = (lower(page), upper(page), special(page));
    if lo < PAGE_HDR_LEN || lo > up || up > sp || sp > page.len() {
        return Err(ZedError::Corruption(
            "page space pointers out of range".into(),
        ));
    }
    Ok((lo, up, sp))
}

/// Number of items in the slotted item-pointer array.
pub fn max_offset(page: &[u8]) -> u16 {
    let lo = lower(page);
    if lo <= PAGE_HDR_LEN {
        0
    } else {
        ((lo - PAGE_HDR_LEN) / ITEM_PTR_LEN) as u16
    }
}

/// Raw bytes of the slotted item at 1-based offset `off`.
pub fn item(page: &[u8], off: u16) -> Result<&[u8]> {
    let (_, up, sp) = check_bounds(page)?;
    if off == 0 || off > max_offset(page) {
        return Err(ZedError::Invalid("item offset out of range"));
    }
    let ptr = PAGE_HDR_LEN + (off as usize - 1) * ITEM_PTR_LEN;
    let start = read_u16(page, ptr..ptr + 2) as usize;
    let len = read_u16(page, ptr + 2..ptr + 4) as usize;
    let end = start
        .checked_add(len)
        .ok_or_else(|| ZedError::Corruption("item extent overflow".into()))?;
    if start < up || end > sp {
        return Err(ZedError::Corruption("item extent out of range".into()));
    }
    Ok(&page[start..end])
}

/// Free room left for one more slotted item's data, accounting for its
/// item pointer. Zero when the page cannot take another item.
pub fn free_space(page: &[u8]) -> usize {
    let (lo, up) = (lower(page), upper(page));
    up.saturating_sub(lo).saturating_sub(ITEM_PTR_LEN)
}

/// Appends `data` as the next slotted item. Items must be appended in key
/// order; the caller rewrites the whole page otherwise.
pub fn add_item(page: &mut [u8], data: &[u8]) -> Result<u16> {
    let (lo, up, _) = check_bounds(page)?;
    if data.is_empty() {
        return Err(ZedError::Invalid("empty item"));
    }
    if free_space(page) < data.len() {
        return Err(ZedError::Invalid("item does not fit on page"));
    }
    let start = up - data.len();
    page[start..up].copy_from_slice(data);
    let off = max_offset(page) + 1;
    let ptr = lo;
    write_u16(page, ptr..ptr + 2, start as u16);
    write_u16(
        page,
        ptr + 2..ptr + 4,
        u16::try_from(data.len()).map_err(|_| ZedError::Invalid("item larger than a page"))?,
    );
    set_lower(page, lo + ITEM_PTR_LEN);
    set_upper(page, start);
    Ok(off)
}

/// Body of an array-layout page (internal, metapage, UNDO): the used bytes
/// between the header and `lower`.
pub fn body(page: &[u8]) -> &[u8] {
    &page[PAGE_HDR_LEN..lower(page)]
}

/// Full body capacity of an array-layout page.
pub fn body_capacity(page: &[u8]) -> usize {
    special(page) - PAGE_HDR_LEN
}

/// Room left in an array-layout page's body.
pub fn body_free(page: &[u8]) -> usize {
    special(page).saturating_sub(lower(page))
}

/// Appends raw bytes to an array-layout page's body.
pub fn body_append(page: &mut [u8], data: &[u8]) -> Result<usize> {
    let (lo, _, sp) = check_bounds(page)?;
    if sp - lo < data.len() {
        return Err(ZedError::Invalid("page body full"));
    }
    page[lo..lo + data.len()].copy_from_slice(data);
    set_lower(page, lo + data.len());
    Ok(lo)
}

fn opaque_range(page: &[u8]) -> Range<usize> {
    special(page)..page.len()
}

fn page_id(page: &[u8]) -> u16 {
    let len = page.len();
    read_u16(page, len - 2..len)
}

/// Tree page opaque data, shared by leaf and internal pages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TreeOpaque {
    pub attno: u16,
    pub next: BlockNumber,
    pub lokey: Tid,
    pub hikey: Tid,
    pub level: u16,
    pub flags: u16,
}

impl TreeOpaque {
    pub fn follow_right(&self) -> bool {
        self.flags & TREE_FLAG_FOLLOW_RIGHT != 0
    }

    pub fn is_root(&self) -> bool {
        self.flags & TREE_FLAG_ROOT != 0
    }

    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }
}

/// Formats `page` as an empty tree page with the given opaque data.
pub fn init_tree_page(page: &mut [u8], opaque: &TreeOpaque) {
    init(page, TREE_OPAQUE_LEN);
    write_tree_opaque(page, opaque);
}

pub fn write_tree_opaque(page: &mut [u8], opaque: &TreeOpaque) {
    let sp = special(page);
    write_u16(page, sp..sp + 2, opaque.attno);
    write_u32_at(page, sp + 2, opaque.next);
    write_u64_at(page, sp + 6, opaque.lokey.0);
    write_u64_at(page, sp + 14, opaque.hikey.0);
    write_u16(page, sp + 22..sp + 24, opaque.level);
    write_u16(page, sp + 24..sp + 26, opaque.flags);
    let len = page.len();
    write_u16(page, len - 2..len, BTREE_PAGE_ID);
}

/// Decodes the tree opaque area, verifying the page-id tag.
pub fn tree_opaque(page: &[u8]) -> Result<TreeOpaque> {
    let sp = check_bounds(page)?.2;
    if page.len() - sp != TREE_OPAQUE_LEN || page_id(page) != BTREE_PAGE_ID {
        return Err(ZedError::Corruption("not a tree page".into()));
    }
    Ok(TreeOpaque {
        attno: read_u16(page, sp..sp + 2),
        next: read_u32_at(page, sp + 2),
        lokey: Tid(read_u64_at(page, sp + 6)),
        hikey: Tid(read_u64_at(page, sp + 14)),
        level: read_u16(page, sp + 22..sp + 24),
        flags: read_u16(page, sp + 24..sp + 26),
    })
}

/// Metapage opaque data: the UNDO log anchors.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MetaOpaque {
    pub undo_counter: u64,
    pub undo_head: BlockNumber,
    pub undo_tail: BlockNumber,
    pub undo_oldest: UndoPtr,
    pub flags: u16,
}

pub fn init_meta_page(page: &mut [u8], opaque: &MetaOpaque) {
    init(page, META_OPAQUE_LEN);
    write_meta_opaque(page, opaque);
}

pub fn write_meta_opaque(page: &mut [u8], opaque: &MetaOpaque) {
    let sp = special(page);
    write_u64_at(page, sp, opaque.undo_counter);
    write_u32_at(page, sp + 8, opaque.undo_head);
    write_u32_at(page, sp + 12, opaque.undo_tail);
    write_u64_at(page, sp + 16, opaque.undo_oldest.0);
    write_u16(page, sp + 24..sp + 26, opaque.flags);
    let len = page.len();
    write_u16(page, len - 2..len, META_PAGE_ID);
}

pub fn meta_opaque(page: &[u8]) -> Result<MetaOpaque> {
    let sp = check_bounds(page)?.2;
    if page.len() - sp != META_OPAQUE_LEN || page_id(page) != META_PAGE_ID {
        return Err(ZedError::Corruption("not a metapage".into()));
    }
    Ok(MetaOpaque {
        undo_counter: read_u64_at(page, sp),
        undo_head: read_u32_at(page, sp + 8),
        undo_tail: read_u32_at(page, sp + 12),
        undo_oldest: UndoPtr(read_u64_at(page, sp + 16)),
        flags: read_u16(page, sp + 24..sp + 26),
    })
}

/// UNDO page opaque data. `first_counter` is the counter of the first
/// record in the page body; records are packed densely, so counters on a
/// page run `first_counter..first_counter + nrecords`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UndoOpaque {
    pub first_counter: u64,
    pub next: BlockNumber,
    pub prev: BlockNumber,
    pub flags: u16,
}

pub fn init_undo_page(page: &mut [u8], opaque: &UndoOpaque) {
    init(page, UNDO_OPAQUE_LEN);
    write_undo_opaque(page, opaque);
}

pub fn write_undo_opaque(page: &mut [u8], opaque: &UndoOpaque) {
    let sp = special(page);
    write_u64_at(page, sp, opaque.first_counter);
    write_u32_at(page, sp + 8, opaque.next);
    write_u32_at(page, sp + 12, opaque.prev);
    write_u16(page, sp + 16..sp + 18, opaque.flags);
    let len = page.len();
    write_u16(page, len - 2..len, UNDO_PAGE_ID);
}

pub fn undo_opaque(page: &[u8]) -> Result<UndoOpaque> {
    let sp = check_bounds(page)?.2;
    if page.len() - sp != UNDO_OPAQUE_LEN || page_id(page) != UNDO_PAGE_ID {
        return Err(ZedError::Corruption("not an UNDO page".into()));
    }
    Ok(UndoOpaque {
        first_counter: read_u64_at(page, sp),
        next: read_u32_at(page, sp + 8),
        prev: read_u32_at(page, sp + 12),
        flags: read_u16(page, sp + 16..sp + 18),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::INVALID_BLOCK;

    fn fresh_tree_page() -> Vec<u8> {
        let mut page = vec![0u8; PAGE_SIZE];
        init_tree_page(
            &mut page,
            &TreeOpaque {
                attno: 1,
                next: INVALID_BLOCK,
                lokey: Tid::MIN,
                hikey: Tid::MAX_PLUS_ONE,
                level: 0,
                flags: TREE_FLAG_ROOT,
            },
        );
        page
    }

    #[test]
    fn tree_opaque_roundtrip() -> Result<()> {
        let page = fresh_tree_page();
        let opaque = tree_opaque(&page)?;
        assert_eq!(opaque.attno, 1);
        assert_eq!(opaque.next, INVALID_BLOCK);
        assert_eq!(opaque.lokey, Tid::MIN);
        assert_eq!(opaque.hikey, Tid::MAX_PLUS_ONE);
        assert!(opaque.is_root());
        assert!(opaque.is_leaf());
        assert!(!opaque.follow_right());
        Ok(())
    }

    #[test]
    fn opaque_tags_are_checked() {
        let mut page = vec![0u8; PAGE_SIZE];
        let meta = MetaOpaque {
            undo_counter: 1,
            undo_head: INVALID_BLOCK,
            undo_tail: INVALID_BLOCK,
            undo_oldest: UndoPtr(1),
            flags: 0,
        };
        init_meta_page(&mut page, &meta);
        assert!(meta_opaque(&page).is_ok());
        assert!(tree_opaque(&page).is_err());
        assert!(undo_opaque(&page).is_err());
    }

    #[test]
    fn slotted_items_append_in_order() -> Result<()> {
        let mut page = fresh_tree_page();
        let first = add_item(&mut page, b"first-item")?;
        let second = add_item(&mut page, b"second")?;
        assert_eq!((first, second), (1, 2));
        assert_eq!(max_offset(&page), 2);
        assert_eq!(item(&page, 1)?, b"first-item");
        assert_eq!(item(&page, 2)?, b"second");
        assert!(item(&page, 3).is_err());
        Ok(())
    }

    #[test]
    fn free_space_shrinks_with_each_item() -> Result<()> {
        let mut page = fresh_tree_page();
        let before = free_space(&page);
        add_item(&mut page, &[0u8; 100])?;
        assert_eq!(free_space(&page), before - 100 - ITEM_PTR_LEN);
        Ok(())
    }

    #[test]
    fn overfull_item_is_refused() {
        let mut page = fresh_tree_page();
        let too_big = vec![0u8; free_space(&page) + 1];
        assert!(add_item(&mut page, &too_big).is_err());
    }

    #[test]
    fn body_append_tracks_lower() -> Result<()> {
        let mut page = vec![0u8; PAGE_SIZE];
        init_undo_page(
            &mut page,
            &UndoOpaque {
                first_counter: 1,
                next: INVALID_BLOCK,
                prev: INVALID_BLOCK,
                flags: 0,
            },
        );
        let cap = body_free(&page);
        body_append(&mut page, b"record")?;
        assert_eq!(body(&page), b"record");
        assert_eq!(body_free(&page), cap - 6);
        Ok(())
    }
}
