//! Metapage and root directory.
//!
//! Block 0 maps attribute numbers to tree roots and anchors the UNDO log.
//! Attribute 0 is the implicit meta-attribute whose items carry row
//! visibility; data attributes are 1-based.

use std::convert::TryFrom;

use tracing::info;

use crate::error::{Result, ZedError};
use crate::primitives::pager::Pager;
use crate::storage::item::AttrDesc;
use crate::storage::page;
use crate::types::{BlockNumber, Tid, UndoPtr, INVALID_BLOCK, META_BLOCK, PAGE_HDR_LEN};

/// Attribute number of the meta-attribute.
pub const META_ATTNO: u16 = 0;

/// Root directory entry layout: `{root:4, attlen:2, attbyval:1}`.
const ENTRY_LEN: usize = 7;
const NATTRS_LEN: usize = 4;

fn entry_offset(attno: u16) -> usize {
    PAGE_HDR_LEN + NATTRS_LEN + attno as usize * ENTRY_LEN
}

fn read_nattrs(meta_page: &[u8]) -> u32 {
    u32::from_be_bytes(
        meta_page[PAGE_HDR_LEN..PAGE_HDR_LEN + NATTRS_LEN]
            .try_into()
            .unwrap(),
    )
}

fn write_nattrs(meta_page: &mut [u8], nattrs: u32) {
    meta_page[PAGE_HDR_LEN..PAGE_HDR_LEN + NATTRS_LEN].copy_from_slice(&nattrs.to_be_bytes());
}

fn read_entry(meta_page: &[u8], attno: u16) -> (BlockNumber, AttrDesc) {
    let off = entry_offset(attno);
    let root = u32::from_be_bytes(meta_page[off..off + 4].try_into().unwrap());
    let attlen = i16::from_be_bytes(meta_page[off + 4..off + 6].try_into().unwrap());
    let attbyval = meta_page[off + 6] != 0;
    (root, AttrDesc { attlen, attbyval })
}

fn write_entry(meta_page: &mut [u8], attno: u16, root: BlockNumber, desc: &AttrDesc) {
    let off = entry_offset(attno);
    meta_page[off..off + 4].copy_from_slice(&root.to_be_bytes());
    meta_page[off + 4..off + 6].copy_from_slice(&desc.attlen.to_be_bytes());
    meta_page[off + 6] = u8::from(desc.attbyval);
}

fn check_attno(meta_page: &[u8], attno: u16) -> Result<()> {
    if u32::from(attno) >= read_nattrs(meta_page) {
        return Err(ZedError::Invalid("attribute number out of range"));
    }
    Ok(())
}

/// Formats block 0 of an empty table: one directory entry per attribute
/// (the meta-attribute first), every root invalid, and the UNDO counters
/// started at 1 so that pointer 0 is always "old".
pub fn init_metapage(pager: &Pager, attrs: &[AttrDesc]) -> Result<()> {
    if attrs.is_empty() {
        return Err(ZedError::Config(
            "tables with zero attributes are not supported".into(),
        ));
    }
    let (pin, blk) = pager.new_page()?;
    if blk != META_BLOCK {
        return Err(ZedError::Invalid("table file is not empty"));
    }
    let mut guard = pin.write();
    page::init_meta_page(
        &mut guard,
        &page::MetaOpaque {
            undo_counter: 1,
            undo_head: INVALID_BLOCK,
            undo_tail: INVALID_BLOCK,
            undo_oldest: UndoPtr(1),
            flags: 0,
        },
    );
    let total = 1 + attrs.len();
    let needed = NATTRS_LEN + total * ENTRY_LEN;
    if needed > page::body_capacity(&guard) {
        return Err(ZedError::Config(format!(
            "{} attributes do not fit in the metapage root directory",
            attrs.len()
        )));
    }
    write_nattrs(&mut guard, u32::try_from(total).expect("bounded by page size"));
    write_entry(&mut guard, META_ATTNO, INVALID_BLOCK, &AttrDesc::META);
    for (i, desc) in attrs.iter().enumerate() {
        write_entry(&mut guard, (i + 1) as u16, INVALID_BLOCK, desc);
    }
    page::set_lower(&mut guard, PAGE_HDR_LEN + needed);
    guard.mark_dirty();
    Ok(())
}

/// Total number of directory entries, the meta-attribute included.
pub fn nattrs(pager: &Pager) -> Result<u16> {
    let pin = pager.pin(META_BLOCK)?;
    let guard = pin.read();
    page::meta_opaque(&guard)?;
    Ok(read_nattrs(&guard) as u16)
}

/// Attribute shape for `attno`.
pub fn attr_desc(pager: &Pager, attno: u16) -> Result<AttrDesc> {
    let pin = pager.pin(META_BLOCK)?;
    let guard = pin.read();
    page::meta_opaque(&guard)?;
    check_attno(&guard, attno)?;
    Ok(read_entry(&guard, attno).1)
}

/// Returns the tree root for `attno`, and the attribute shape stored with
/// it. With `for_update`, an empty tree gets a fresh leaf root allocated
/// and recorded on the spot; otherwise an empty tree reads as
/// `INVALID_BLOCK`.
pub fn get_root(pager: &Pager, attno: u16, for_update: bool) -> Result<(BlockNumber, AttrDesc)> {
    let pin = pager.pin(META_BLOCK)?;
    if !for_update {
        let guard = pin.read();
        page::meta_opaque(&guard)?;
        check_attno(&guard, attno)?;
        let (root, desc) = read_entry(&guard, attno);
        return Ok((root, desc));
    }
    let mut guard = pin.write();
    page::meta_opaque(&guard)?;
    check_attno(&guard, attno)?;
    let (root, desc) = read_entry(&guard, attno);
    if root != INVALID_BLOCK {
        return Ok((root, desc));
    }
    let (root_pin, root_blk) = pager.new_page()?;
    {
        let mut root_guard = root_pin.write();
        page::init_tree_page(
            &mut root_guard,
            &page::TreeOpaque {
                attno,
                next: INVALID_BLOCK,
                lokey: Tid::MIN,
                hikey: Tid::MAX_PLUS_ONE,
                level: 0,
                flags: page::TREE_FLAG_ROOT,
            },
        );
        root_guard.mark_dirty();
    }
    write_entry(&mut guard, attno, root_blk, &desc);
    guard.mark_dirty();
    Ok((root_blk, desc))
}

/// Points `attno` at a new root. The caller already holds the metapage
/// exclusively; root growth swaps the root while parked on that lock.
pub fn update_root_locked(meta_page: &mut [u8], attno: u16, root: BlockNumber) -> Result<()> {
    page::meta_opaque(meta_page)?;
    check_attno(meta_page, attno)?;
    let (_, desc) = read_entry(meta_page, attno);
    write_entry(meta_page, attno, root, &desc);
    Ok(())
}

/// Extends the root directory for newly added attributes. The directory
/// must stay within the metapage; overflowing it is a configuration
/// error, not something the engine can shuffle around.
pub fn add_attributes(pager: &Pager, attrs: &[AttrDesc]) -> Result<()> {
    if attrs.is_empty() {
        return Ok(());
    }
    let pin = pager.pin(META_BLOCK)?;
    let mut guard = pin.write();
    page::meta_opaque(&guard)?;
    let old = read_nattrs(&guard) as usize;
    let total = old + attrs.len();
    let needed = NATTRS_LEN + total * ENTRY_LEN;
    if needed > page::body_capacity(&guard) {
        return Err(ZedError::Config(format!(
            "root directory cannot grow to {total} attributes"
        )));
    }
    for (i, desc) in attrs.iter().enumerate() {
        write_entry(&mut guard, (old + i) as u16, INVALID_BLOCK, desc);
    }
    write_nattrs(&mut guard, total as u32);
    page::set_lower(&mut guard, PAGE_HDR_LEN + needed);
    guard.mark_dirty();
    info!(added = attrs.len(), total, "extended root directory");
    Ok(())
}
