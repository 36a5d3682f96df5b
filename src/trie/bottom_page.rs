//! `BottomPage` (spec §4.3.2): a compact sub-trie that delays promotion to
//! a full `DataPage`. Up to 16 children, indexed by `first_nibble(key)`,
//! are themselves `BottomPage`s; once all 16 are allocated and still
//! overfull, the page promotes itself to a `DataPage` in place.
//!
//! This crate uses the 16-bucket layout (spec §9 lists 16/4/2-bucket
//! historical variants; see DESIGN.md for the choice).

use crate::address::DbAddress;
use crate::batch::BatchContext;
use crate::error::Result;
use crate::nibble::NibblePath;
use crate::page::{Page, PageType};
use crate::slotted::SlottedArray;

use super::data_page;

const CHILD_COUNT: usize = 16;
const CHILDREN_BYTES: usize = CHILD_COUNT * 4;

pub fn init(page: &mut Page) {
    page.set_metadata(0);
    page.payload_mut()[0..CHILDREN_BYTES].fill(0);
    SlottedArray::wrap(&mut page.payload_mut()[CHILDREN_BYTES..]).clear();
}

fn child(page: &Page, nibble: usize) -> DbAddress {
    let o = nibble * 4;
    DbAddress::new(u32::from_le_bytes(page.payload()[o..o + 4].try_into().unwrap()))
}

fn set_child(page: &mut Page, nibble: usize, addr: DbAddress) {
    let o = nibble * 4;
    page.payload_mut()[o..o + 4].copy_from_slice(&addr.raw().to_le_bytes());
}

pub fn children(page: &Page) -> [DbAddress; CHILD_COUNT] {
    let mut out = [DbAddress::NULL; CHILD_COUNT];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = child(page, i);
    }
    out
}

fn local(page: &mut Page) -> SlottedArray<'_> {
    SlottedArray::wrap(&mut page.payload_mut()[CHILDREN_BYTES..])
}

pub fn set(ctx: &mut BatchContext, root: &mut DbAddress, key: NibblePath<'_>, value: &[u8]) -> Result<()> {
    let mut page = ctx.ensure_writable_copy(root)?;

    if value.is_empty() {
        local(&mut page).delete(&key);
        let nibble = key.first_nibble() as usize;
        let mut c = child(&page, nibble);
        ctx.save(*root, &page);
        if !c.is_null() {
            super::set_in(ctx, &mut c, key.slice_from(1), &[])?;
            let mut page = ctx.get_at(*root)?;
            set_child(&mut page, nibble, c);
            ctx.save(*root, &page);
        }
        return Ok(());
    }

    if local(&mut page).try_set(&key, value) {
        ctx.save(*root, &page);
        return Ok(());
    }

    distribute_to_children(ctx, root, &key)?;

    let mut page = ctx.get_at(*root)?;
    if local(&mut page).try_set(&key, value) {
        ctx.save(*root, &page);
        return Ok(());
    }

    if allocate_remaining_children(ctx, root)? {
        distribute_to_children(ctx, root, &key)?;
        let mut page = ctx.get_at(*root)?;
        if local(&mut page).try_set(&key, value) {
            ctx.save(*root, &page);
            return Ok(());
        }
    }

    promote_to_data_page(ctx, root)?;
    data_page::set(ctx, root, key, value)
}

/// Flushes every nibble bucket that already has a child down to it,
/// preferring children already written this batch (write-through, no COW)
/// before falling back to COW-ing older ones.
fn distribute_to_children(ctx: &mut BatchContext, root: &mut DbAddress, _hint: &NibblePath<'_>) -> Result<()> {
    let page = ctx.get_at(*root)?;
    let existing = children(&page);
    for nibble in 0..CHILD_COUNT {
        if existing[nibble].is_null() {
            continue;
        }
        let entries = {
            let mut page = ctx.get_at(*root)?;
            local(&mut page).enumerate_nibble(nibble as u8)
        };
        if entries.is_empty() {
            continue;
        }
        let mut c = existing[nibble];
        for (key, value) in entries {
            let rest = key.as_view().slice_from(1);
            super::set_in(ctx, &mut c, rest, &value)?;
        }
        let mut page = ctx.get_at(*root)?;
        local(&mut page).remove_nibble(nibble as u8);
        set_child(&mut page, nibble, c);
        ctx.save(*root, &page);
    }
    Ok(())
}

/// Allocates a fresh `BottomPage` child for the nibble with the largest
/// accumulated local size among still-unallocated buckets. Returns `false`
/// once all 16 children exist (caller must promote to `DataPage`).
fn allocate_remaining_children(ctx: &mut BatchContext, root: &mut DbAddress) -> Result<bool> {
    let (stats, existing) = {
        let mut page = ctx.get_at(*root)?;
        let stats = local(&mut page).gather_size_stats_1_nibble();
        (stats, children(&page))
    };
    let mut best: Option<usize> = None;
    for nibble in 0..CHILD_COUNT {
        if existing[nibble].is_null() && stats[nibble] > 0 {
            let better = match best {
                Some(b) => stats[nibble] > stats[b],
                None => true,
            };
            if better {
                best = Some(nibble);
            }
        }
    }
    let Some(nibble) = best else {
        return Ok(false);
    };
    let (mut child_page, addr) = ctx.get_new_page(PageType::Bottom)?;
    init(&mut child_page);
    ctx.save(addr, &child_page);
    let mut page = ctx.get_at(*root)?;
    set_child(&mut page, nibble, addr);
    ctx.save(*root, &page);
    Ok(true)
}

/// Turns this page into a `DataPage` in place: re-distributes every child's
/// entries, re-setting each one (a child whose nibble no longer matches its
/// slot after promotion is handled correctly because `Set` re-derives the
/// target bucket from the key itself).
fn promote_to_data_page(ctx: &mut BatchContext, root: &mut DbAddress) -> Result<()> {
    let existing = {
        let page = ctx.get_at(*root)?;
        children(&page)
    };
    let mut entries = {
        let mut page = ctx.get_at(*root)?;
        local(&mut page).enumerate_all()
    };
    for addr in existing {
        if addr.is_null() {
            continue;
        }
        entries.extend(collect_subtree(ctx, addr)?);
        super::release_subtree(ctx, addr)?;
    }

    let mut page = ctx.get_at(*root)?;
    page.set_page_type(PageType::Data);
    data_page::init_leaf(&mut page);
    ctx.save(*root, &page);

    for (key, value) in entries {
        if !value.is_empty() {
            super::set_in(ctx, root, key.as_view(), &value)?;
        }
    }
    Ok(())
}

/// Collects every live key in a `BottomPage` subtree, reconstituting full
/// keys by prepending the nibble path consumed at each level.
fn collect_subtree(
    ctx: &BatchContext,
    addr: DbAddress,
) -> Result<Vec<(crate::nibble::OwnedNibblePath, Vec<u8>)>> {
    let mut page = ctx.get_at(addr)?;
    let mut out = local(&mut page).enumerate_all();
    for (nibble, child_addr) in children(&page).into_iter().enumerate() {
        if child_addr.is_null() {
            continue;
        }
        for (key, value) in collect_subtree(ctx, child_addr)? {
            let prefix_byte = [(nibble as u8) << 4];
            let prefix = NibblePath::from_bytes(&prefix_byte).slice_to(1);
            let mut scratch = Vec::new();
            let full = prefix.append(&key.as_view(), &mut scratch);
            out.push((crate::nibble::OwnedNibblePath::from_view(&full), value));
        }
    }
    Ok(out)
}

pub fn get(ctx: &BatchContext, root: DbAddress, key: NibblePath<'_>) -> Result<Option<Vec<u8>>> {
    let mut page = ctx.get_at(root)?;
    if let Some(v) = local(&mut page).try_get(&key) {
        return Ok(Some(v.to_vec()));
    }
    let nibble = key.first_nibble() as usize;
    let c = child(&page, nibble);
    if c.is_null() {
        return Ok(None);
    }
    get(ctx, c, key.slice_from(1))
}

pub fn delete_by_prefix(ctx: &mut BatchContext, root: &mut DbAddress, prefix: NibblePath<'_>) -> Result<()> {
    let mut page = ctx.ensure_writable_copy(root)?;
    local(&mut page).delete_by_prefix(&prefix);
    let nibble = prefix.first_nibble() as usize;
    let mut c = child(&page, nibble);
    ctx.save(*root, &page);
    if !c.is_null() {
        super::delete_by_prefix_in(ctx, &mut c, prefix.slice_from(1))?;
        let mut page = ctx.get_at(*root)?;
        set_child(&mut page, nibble, c);
        ctx.save(*root, &page);
    }
    Ok(())
}
