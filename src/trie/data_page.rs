//! `DataPage` (spec §4.3.1): the main trie node. Has two modes, encoded in
//! `header.metadata` bit 0: `Leaf` (buckets 0/1 are two `LeafOverflowPage`
//! pointers backing an in-page `SlottedArray`) and `Fanout` (all 16 buckets
//! index children by `first_nibble(key)`).

use crate::address::DbAddress;
use crate::batch::BatchContext;
use crate::error::Result;
use crate::nibble::NibblePath;
use crate::page::{Page, PageType};
use crate::slotted::SlottedArray;

use super::leaf_overflow;

const CHILD_COUNT: usize = 16;
const CHILDREN_BYTES: usize = CHILD_COUNT * 4;
const FANOUT_BIT: u8 = 0x01;

pub fn init_leaf(page: &mut Page) {
    page.set_metadata(0);
    page.payload_mut()[0..CHILDREN_BYTES].fill(0);
    SlottedArray::wrap(&mut page.payload_mut()[CHILDREN_BYTES..]).clear();
}

fn is_fanout(page: &Page) -> bool {
    page.metadata() & FANOUT_BIT != 0
}

fn set_fanout_mode(page: &mut Page) {
    page.set_metadata(page.metadata() | FANOUT_BIT);
}

fn child(page: &Page, nibble: usize) -> DbAddress {
    let o = nibble * 4;
    DbAddress::new(u32::from_le_bytes(page.payload()[o..o + 4].try_into().unwrap()))
}

fn set_child(page: &mut Page, nibble: usize, addr: DbAddress) {
    let o = nibble * 4;
    page.payload_mut()[o..o + 4].copy_from_slice(&addr.raw().to_le_bytes());
}

/// All 16 addresses in a page's child slot array, regardless of mode. Used
/// by `release_subtree` to walk a subtree being cleared.
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

/// Leaf-mode "keep it local" rule isn't used (leaf keeps everything local by
/// definition); this is the Fanout-mode rule from spec §4.3.1: a one-nibble
/// key whose nibble is a multiple of 4 stays in the page's own map instead
/// of being pushed into a child, to keep short, common prefixes
/// cache-resident.
fn should_keep_short_key_local(key: &NibblePath<'_>) -> bool {
    key.len() == 1 && key.first_nibble() % 4 == 0
}

pub fn set(ctx: &mut BatchContext, root: &mut DbAddress, key: NibblePath<'_>, value: &[u8]) -> Result<()> {
    let page = ctx.ensure_writable_copy(root)?;
    if is_fanout(&page) {
        set_fanout(ctx, root, key, value)
    } else {
        set_leaf(ctx, root, key, value)
    }
}

fn set_leaf(ctx: &mut BatchContext, root: &mut DbAddress, key: NibblePath<'_>, value: &[u8]) -> Result<()> {
    let mut page = ctx.get_at(*root)?;
    if local(&mut page).try_set(&key, value) {
        ctx.save(*root, &page);
        return Ok(());
    }
    migrate_to_leaf_overflow(ctx, root)?;
    let mut page = ctx.get_at(*root)?;
    if local(&mut page).try_set(&key, value) {
        ctx.save(*root, &page);
        return Ok(());
    }
    promote_to_fanout(ctx, root)?;
    set_fanout(ctx, root, key, value)
}

/// Materializes the two overflow children (allocating/COW-ing as needed)
/// and moves every non-empty local key into the one selected by
/// `fingerprint() & 1`, per spec §4.3.1's "16-bucket partitioning" (folded
/// to 2 buckets here since a Leaf page only has two overflow slots).
fn migrate_to_leaf_overflow(ctx: &mut BatchContext, root: &mut DbAddress) -> Result<()> {
    let mut bucket_addrs = [DbAddress::NULL; 2];
    for (slot, bucket_addr) in bucket_addrs.iter_mut().enumerate() {
        let existing = child(&ctx.get_at(*root)?, slot);
        let addr = if existing.is_null() {
            let (mut ov, ov_addr) = ctx.get_new_page(PageType::LeafOverflow)?;
            leaf_overflow::init(&mut ov);
            ctx.save(ov_addr, &ov);
            ov_addr
        } else {
            ctx.get_writable_copy(existing)?.1
        };
        *bucket_addr = addr;
        let mut page = ctx.get_at(*root)?;
        set_child(&mut page, slot, addr);
        ctx.save(*root, &page);
    }

    let entries = {
        let mut page = ctx.get_at(*root)?;
        local(&mut page).enumerate_all()
    };
    for (key, value) in entries {
        if key.is_empty() {
            continue;
        }
        let bucket = (key.as_view().fingerprint() as usize) & 1;
        let mut cpage = ctx.get_at(bucket_addrs[bucket])?;
        SlottedArray::wrap(cpage.payload_mut()).try_set(&key.as_view(), &value);
        ctx.save(bucket_addrs[bucket], &cpage);
    }

    let mut page = ctx.get_at(*root)?;
    local(&mut page).clear();
    ctx.save(*root, &page);
    Ok(())
}

/// Promotes a Leaf page to Fanout mode by re-running `Set` for every entry
/// in the two overflow pages, then freeing them.
fn promote_to_fanout(ctx: &mut BatchContext, root: &mut DbAddress) -> Result<()> {
    let overflow_addrs = [child(&ctx.get_at(*root)?, 0), child(&ctx.get_at(*root)?, 1)];
    let mut entries = Vec::new();
    for addr in overflow_addrs {
        if !addr.is_null() {
            let mut page = ctx.get_at(addr)?;
            entries.extend(SlottedArray::wrap(page.payload_mut()).enumerate_all());
            ctx.register_for_future_reuse(addr, false);
        }
    }

    let mut page = ctx.get_at(*root)?;
    set_fanout_mode(&mut page);
    for i in 0..CHILD_COUNT {
        set_child(&mut page, i, DbAddress::NULL);
    }
    local(&mut page).clear();
    ctx.save(*root, &page);

    for (key, value) in entries {
        if !value.is_empty() {
            set_fanout(ctx, root, key.as_view(), &value)?;
        }
    }
    Ok(())
}

fn set_fanout(ctx: &mut BatchContext, root: &mut DbAddress, key: NibblePath<'_>, value: &[u8]) -> Result<()> {
    let page = ctx.ensure_writable_copy(root)?;
    let nibble = key.first_nibble() as usize;
    let existing_child = child(&page, nibble);

    if value.is_empty() {
        if existing_child.is_null() || should_keep_short_key_local(&key) {
            let mut page = ctx.get_at(*root)?;
            local(&mut page).delete(&key);
            ctx.save(*root, &page);
        } else {
            let mut child_addr = existing_child;
            super::set_in(ctx, &mut child_addr, key.slice_from(1), value)?;
            let mut page = ctx.get_at(*root)?;
            set_child(&mut page, nibble, child_addr);
            ctx.save(*root, &page);
        }
        return Ok(());
    }

    if !existing_child.is_null() && !should_keep_short_key_local(&key) {
        let mut child_addr = existing_child;
        super::set_in(ctx, &mut child_addr, key.slice_from(1), value)?;
        let mut page = ctx.get_at(*root)?;
        set_child(&mut page, nibble, child_addr);
        ctx.save(*root, &page);
        return Ok(());
    }

    let mut page = ctx.get_at(*root)?;
    if local(&mut page).try_set(&key, value) {
        ctx.save(*root, &page);
        return Ok(());
    }

    flush_most_frequent_nibble(ctx, root)?;
    set_fanout(ctx, root, key, value)
}

/// Nibbles eligible for `should_keep_short_key_local` are discounted before
/// being compared as flush candidates, so a page prefers to flush a nibble
/// that cannot benefit from local caching in the first place (spec §4.3.1
/// step 5's "small keep-local discount").
fn apply_keep_local_discount(mut stats: [u32; CHILD_COUNT]) -> [u32; CHILD_COUNT] {
    for nibble in (0..CHILD_COUNT).step_by(4) {
        stats[nibble] -= stats[nibble] / 8;
    }
    stats
}

/// Picks a nibble to flush down, preferring (spec §4.3.1 step 5/6) one with
/// an existing child (write-through, no allocation) over allocating a fresh
/// child; lowest nibble wins ties.
fn flush_most_frequent_nibble(ctx: &mut BatchContext, root: &mut DbAddress) -> Result<()> {
    let (stats, existing) = {
        let mut page = ctx.get_at(*root)?;
        let stats = apply_keep_local_discount(local(&mut page).gather_count_stats_1_nibble());
        let mut existing = [DbAddress::NULL; CHILD_COUNT];
        for (i, slot) in existing.iter_mut().enumerate() {
            *slot = child(&page, i);
        }
        (stats, existing)
    };

    let mut best_existing: Option<usize> = None;
    for nibble in 0..CHILD_COUNT {
        if !existing[nibble].is_null() && stats[nibble] > 0 {
            let better = match best_existing {
                Some(b) => stats[nibble] > stats[b],
                None => true,
            };
            if better {
                best_existing = Some(nibble);
            }
        }
    }

    let (nibble, child_addr) = if let Some(nibble) = best_existing {
        let (_, addr) = ctx.get_writable_copy(existing[nibble])?;
        if addr != existing[nibble] {
            let mut page = ctx.get_at(*root)?;
            set_child(&mut page, nibble, addr);
            ctx.save(*root, &page);
        }
        (nibble, addr)
    } else {
        let mut nibble = 0usize;
        for n in 1..CHILD_COUNT {
            if stats[n] > stats[nibble] {
                nibble = n;
            }
        }
        let (mut child_page, addr) = ctx.get_new_page(PageType::Data)?;
        init_leaf(&mut child_page);
        ctx.save(addr, &child_page);
        let mut page = ctx.get_at(*root)?;
        set_child(&mut page, nibble, addr);
        ctx.save(*root, &page);
        (nibble, addr)
    };

    let entries = {
        let mut page = ctx.get_at(*root)?;
        local(&mut page).enumerate_nibble(nibble as u8)
    };
    let mut child_addr = child_addr;
    for (key, value) in entries {
        let rest = key.as_view().slice_from(1);
        if value.is_empty() {
            super::set_in(ctx, &mut child_addr, rest, &[])?;
        } else {
            super::set_in(ctx, &mut child_addr, rest, &value)?;
        }
    }
    let mut page = ctx.get_at(*root)?;
    local(&mut page).remove_nibble(nibble as u8);
    set_child(&mut page, nibble, child_addr);
    ctx.save(*root, &page);
    Ok(())
}

pub fn get(ctx: &BatchContext, root: DbAddress, key: NibblePath<'_>) -> Result<Option<Vec<u8>>> {
    let mut page = ctx.get_at(root)?;
    if !is_fanout(&page) {
        if let Some(v) = local(&mut page).try_get(&key) {
            return Ok(Some(v.to_vec()));
        }
        let bucket = (key.fingerprint() as usize) & 1;
        let addr = child(&page, bucket);
        if addr.is_null() {
            return Ok(None);
        }
        return leaf_overflow::get(ctx, addr, key);
    }
    if let Some(v) = local(&mut page).try_get(&key) {
        return Ok(Some(v.to_vec()));
    }
    let nibble = key.first_nibble() as usize;
    let c = child(&page, nibble);
    if c.is_null() {
        return Ok(None);
    }
    super::get_in(ctx, c, key.slice_from(1))
}

pub fn delete_by_prefix(ctx: &mut BatchContext, root: &mut DbAddress, prefix: NibblePath<'_>) -> Result<()> {
    let mut page = ctx.ensure_writable_copy(root)?;
    local(&mut page).delete_by_prefix(&prefix);
    if is_fanout(&page) {
        let nibble = prefix.first_nibble() as usize;
        let mut c = child(&page, nibble);
        if !c.is_null() {
            super::delete_by_prefix_in(ctx, &mut c, prefix.slice_from(1))?;
            let mut page = ctx.get_at(*root)?;
            set_child(&mut page, nibble, c);
            ctx.save(*root, &page);
        }
    } else {
        for slot in 0..2 {
            let mut c = child(&page, slot);
            if !c.is_null() {
                leaf_overflow::delete_by_prefix(ctx, &mut c, prefix)?;
                if c != child(&page, slot) {
                    set_child(&mut page, slot, c);
                }
            }
        }
        ctx.save(*root, &page);
    }
    Ok(())
}
