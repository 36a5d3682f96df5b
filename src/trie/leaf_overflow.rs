//! `LeafOverflowPage` (spec §4.3.3): a flat `SlottedArray` page used to hold
//! keys migrated out of an overfull `DataPage` leaf bucket. It cannot fan
//! out further; when it overfills, the caller (`DataPage`'s leaf-set
//! protocol) is responsible for promoting its parent to `Fanout` mode.
//!
//! Implemented as a direct `SlottedArray` page rather than the
//! synthetic-16-bit-id `UShortSlottedArray` dialect spec §9 also mentions
//! (see DESIGN.md).

use crate::address::DbAddress;
use crate::batch::BatchContext;
use crate::error::Result;
use crate::nibble::NibblePath;
use crate::page::Page;
use crate::slotted::SlottedArray;

pub fn init(page: &mut Page) {
    SlottedArray::wrap(page.payload_mut()).clear();
}

/// Attempts to store `key -> value` in place. Returns `false` if the page
/// has no room even after defragmentation, in which case the caller must
/// redistribute this page's contents elsewhere.
pub fn try_set(page: &mut Page, key: &NibblePath<'_>, value: &[u8]) -> bool {
    SlottedArray::wrap(page.payload_mut()).try_set(key, value)
}

pub fn set(ctx: &mut BatchContext, root: &mut DbAddress, key: NibblePath<'_>, value: &[u8]) -> Result<()> {
    let mut page = ctx.ensure_writable_copy(root)?;
    SlottedArray::wrap(page.payload_mut()).try_set(&key, value);
    ctx.save(*root, &page);
    Ok(())
}

pub fn get(ctx: &BatchContext, root: DbAddress, key: NibblePath<'_>) -> Result<Option<Vec<u8>>> {
    let mut page = ctx.get_at(root)?;
    Ok(SlottedArray::wrap(page.payload_mut()).try_get(&key).map(|v| v.to_vec()))
}

pub fn delete_by_prefix(ctx: &mut BatchContext, root: &mut DbAddress, prefix: NibblePath<'_>) -> Result<()> {
    let mut page = ctx.ensure_writable_copy(root)?;
    SlottedArray::wrap(page.payload_mut()).delete_by_prefix(&prefix);
    ctx.save(*root, &page);
    Ok(())
}
