//! The prefix-trie page family (spec §4.3): `DataPage`, `BottomPage`,
//! `LeafOverflowPage`, and `StorageFanOut`, plus the generic dispatch used by
//! both the root state trie and the per-bucket storage tries.
//!
//! Every page that can head a subtree implements the same three operations
//! (`Set`, `TryGet`, `DeleteByPrefix`) over `NibblePath` keys; [`set_in`],
//! [`get_in`], and [`delete_by_prefix_in`] dispatch on the page's
//! [`crate::page::PageType`] so callers (root-page routing, storage
//! fan-out buckets) don't need to know which page variant currently heads a
//! given subtree.

pub mod bottom_page;
pub mod data_page;
pub mod leaf_overflow;
pub mod storage_fanout;

use crate::address::DbAddress;
use crate::batch::BatchContext;
use crate::error::{Error, Result};
use crate::nibble::NibblePath;
use crate::page::PageType;

fn unsupported_root_page_type() -> Error {
    Error::InvariantViolated("trie subtree root is not a Data/Bottom/LeafOverflow page")
}

/// Sets `key -> value` in the subtree rooted at `*root`, allocating a fresh
/// `BottomPage` if the subtree is still empty (spec §4.3.2: new subtrees
/// start compact and only promote to `DataPage` once they overfill). An
/// empty `value` deletes the key; deleting from an empty subtree is a no-op.
pub fn set_in(ctx: &mut BatchContext, root: &mut DbAddress, key: NibblePath<'_>, value: &[u8]) -> Result<()> {
    if root.is_null() {
        if value.is_empty() {
            return Ok(());
        }
        let (mut page, addr) = ctx.get_new_page(PageType::Bottom)?;
        bottom_page::init(&mut page);
        ctx.save(addr, &page);
        *root = addr;
    }
    let page_type = ctx.get_at(*root)?.page_type()?;
    match page_type {
        PageType::Data => data_page::set(ctx, root, key, value),
        PageType::Bottom => bottom_page::set(ctx, root, key, value),
        PageType::LeafOverflow => leaf_overflow::set(ctx, root, key, value),
        _ => Err(unsupported_root_page_type()),
    }
}

pub fn get_in(ctx: &BatchContext, root: DbAddress, key: NibblePath<'_>) -> Result<Option<Vec<u8>>> {
    if root.is_null() {
        return Ok(None);
    }
    let page = ctx.get_at(root)?;
    match page.page_type()? {
        PageType::Data => data_page::get(ctx, root, key),
        PageType::Bottom => bottom_page::get(ctx, root, key),
        PageType::LeafOverflow => leaf_overflow::get(ctx, root, key),
        _ => Err(unsupported_root_page_type()),
    }
}

/// Deletes every key starting with `prefix` from the subtree rooted at
/// `*root`. Deleting with an empty prefix clears the whole subtree and
/// releases `*root` itself, leaving it `NULL`.
pub fn delete_by_prefix_in(ctx: &mut BatchContext, root: &mut DbAddress, prefix: NibblePath<'_>) -> Result<()> {
    if root.is_null() {
        return Ok(());
    }
    if prefix.is_empty() {
        release_subtree(ctx, *root)?;
        *root = DbAddress::NULL;
        return Ok(());
    }
    let page_type = ctx.get_at(*root)?.page_type()?;
    match page_type {
        PageType::Data => data_page::delete_by_prefix(ctx, root, prefix),
        PageType::Bottom => bottom_page::delete_by_prefix(ctx, root, prefix),
        PageType::LeafOverflow => leaf_overflow::delete_by_prefix(ctx, root, prefix),
        _ => Err(unsupported_root_page_type()),
    }
}

/// Recursively registers every page in the subtree rooted at `addr` for
/// future reuse. Used by `DeleteByPrefix("")` and by `BottomPage`'s
/// promote-to-`DataPage` step when a child slot collapses.
pub(crate) fn release_subtree(ctx: &mut BatchContext, addr: DbAddress) -> Result<()> {
    if addr.is_null() {
        return Ok(());
    }
    let page = ctx.get_at(addr)?;
    match page.page_type()? {
        PageType::Data => {
            for child in data_page::children(&page) {
                release_subtree(ctx, child)?;
            }
        }
        PageType::Bottom => {
            for child in bottom_page::children(&page) {
                release_subtree(ctx, child)?;
            }
        }
        PageType::LeafOverflow => {}
        _ => return Err(unsupported_root_page_type()),
    }
    ctx.register_for_future_reuse(addr, false);
    Ok(())
}
