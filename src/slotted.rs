//! In-page ordered map from `NibblePath` to an opaque byte value
//! (spec §4.2, `SlottedArray`).
//!
//! Layout inside the wrapped buffer, grounded on the slot-array-plus-cell-
//! heap idiom of `nervusdb-v2-storage/src/index/btree.rs`:
//!
//! ```text
//! [0..2)   slot_count: u16
//! [2..4)   heap_low:   u16   (offset of the lowest occupied heap byte)
//! [4..6)   wasted:     u16   (bytes in the heap orphaned by updates/deletes)
//! [6..)    slot[0], slot[1], ... growing upward
//!                                        ... heap entries, growing downward
//! ```
//!
//! Slots are kept sorted by `(fingerprint, key bytes)` so lookups are a
//! binary search rather than a linear scan. Each slot is 8 bytes:
//! `fingerprint: u16, key_nibble_len: u16, entry_offset: u16, _reserved: u16`.
//!
//! A heap entry is `[key_byte_len: u8][key bytes][value_len: u16][value
//! bytes]`. A tombstone is an entry whose `value_len` is 0 — the key is
//! still present so `try_get` can distinguish "never set" from "deleted".

use crate::nibble::{NibblePath, OwnedNibblePath};

const MINI_HEADER: usize = 6;
const SLOT_SIZE: usize = 8;

fn slot_count(buf: &[u8]) -> usize {
    u16::from_le_bytes(buf[0..2].try_into().unwrap()) as usize
}

fn set_slot_count(buf: &mut [u8], n: usize) {
    buf[0..2].copy_from_slice(&(n as u16).to_le_bytes());
}

fn heap_low(buf: &[u8]) -> usize {
    u16::from_le_bytes(buf[2..4].try_into().unwrap()) as usize
}

fn set_heap_low(buf: &mut [u8], v: usize) {
    buf[2..4].copy_from_slice(&(v as u16).to_le_bytes());
}

fn wasted(buf: &[u8]) -> usize {
    u16::from_le_bytes(buf[4..6].try_into().unwrap()) as usize
}

fn set_wasted(buf: &mut [u8], v: usize) {
    buf[4..6].copy_from_slice(&(v.min(u16::MAX as usize) as u16).to_le_bytes());
}

fn slot_off(i: usize) -> usize {
    MINI_HEADER + i * SLOT_SIZE
}

struct Slot {
    fingerprint: u16,
    key_nibble_len: u16,
    entry_offset: u16,
}

fn read_slot(buf: &[u8], i: usize) -> Slot {
    let o = slot_off(i);
    Slot {
        fingerprint: u16::from_le_bytes(buf[o..o + 2].try_into().unwrap()),
        key_nibble_len: u16::from_le_bytes(buf[o + 2..o + 4].try_into().unwrap()),
        entry_offset: u16::from_le_bytes(buf[o + 4..o + 6].try_into().unwrap()),
    }
}

fn write_slot(buf: &mut [u8], i: usize, slot: &Slot) {
    let o = slot_off(i);
    buf[o..o + 2].copy_from_slice(&slot.fingerprint.to_le_bytes());
    buf[o + 2..o + 4].copy_from_slice(&slot.key_nibble_len.to_le_bytes());
    buf[o + 4..o + 6].copy_from_slice(&slot.entry_offset.to_le_bytes());
    buf[o + 6..o + 8].copy_from_slice(&0u16.to_le_bytes());
}

fn entry_key_byte_len(nibble_len: u16) -> usize {
    (nibble_len as usize).div_ceil(2)
}

fn entry_total_size(key_nibble_len: u16, value_len: usize) -> usize {
    1 + entry_key_byte_len(key_nibble_len) + 2 + value_len
}

/// A view over a page payload (or any sufficiently large buffer) as a
/// slotted array.
pub struct SlottedArray<'a> {
    buf: &'a mut [u8],
}

impl<'a> SlottedArray<'a> {
    /// Wraps `buf`. Callers are responsible for having zeroed it (via
    /// [`crate::page::Page::init`]) the first time a page becomes this
    /// page type.
    pub fn wrap(buf: &'a mut [u8]) -> Self {
        Self { buf }
    }

    pub fn is_empty(&self) -> bool {
        slot_count(self.buf) == 0
    }

    pub fn len(&self) -> usize {
        slot_count(self.buf)
    }

    fn capacity_bytes(&self) -> usize {
        self.buf.len()
    }

    fn free_space(&self) -> usize {
        let used_slots = MINI_HEADER + slot_count(self.buf) * SLOT_SIZE;
        heap_low(self.buf).saturating_sub(used_slots)
    }

    fn entry_key<'b>(buf: &'b [u8], entry_offset: usize) -> &'b [u8] {
        let key_byte_len = buf[entry_offset] as usize;
        &buf[entry_offset + 1..entry_offset + 1 + key_byte_len]
    }

    fn entry_value<'b>(buf: &'b [u8], entry_offset: usize) -> &'b [u8] {
        let key_byte_len = buf[entry_offset] as usize;
        let vlen_off = entry_offset + 1 + key_byte_len;
        let vlen = u16::from_le_bytes(buf[vlen_off..vlen_off + 2].try_into().unwrap()) as usize;
        &buf[vlen_off + 2..vlen_off + 2 + vlen]
    }

    fn key_matches(buf: &[u8], slot: &Slot, key: &NibblePath<'_>) -> bool {
        if slot.key_nibble_len as usize != key.len() {
            return false;
        }
        let stored = Self::entry_key(buf, slot.entry_offset as usize);
        let (want, _) = key.to_owned_bytes();
        stored == want.as_slice()
    }

    /// Binary search by `(fingerprint, key bytes)`. `Ok(i)` if present,
    /// `Err(i)` with the sorted insertion point otherwise.
    fn find(&self, key: &NibblePath<'_>) -> Result<usize, usize> {
        let fp = key.fingerprint();
        let n = slot_count(self.buf);
        let (want, _) = key.to_owned_bytes();
        let mut lo = 0usize;
        let mut hi = n;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let slot = read_slot(self.buf, mid);
            let ord = slot
                .fingerprint
                .cmp(&fp)
                .then_with(|| Self::entry_key(self.buf, slot.entry_offset as usize).cmp(want.as_slice()));
            match ord {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => {
                    if slot.key_nibble_len as usize == key.len() {
                        return Ok(mid);
                    }
                    // fingerprint+bytes collision with different nibble parity; scan outward.
                    lo = mid;
                    hi = mid;
                    break;
                }
            }
        }
        // Linear fallback scan around the insertion point to catch the rare
        // fingerprint-byte-tie-but-different-length case above.
        for i in lo.saturating_sub(1)..=(lo + 1).min(n.saturating_sub(1)) {
            if i < n {
                let slot = read_slot(self.buf, i);
                if slot.fingerprint == fp && Self::key_matches(self.buf, &slot, key) {
                    return Ok(i);
                }
            }
        }
        Err(lo)
    }

    fn insert_slot_at(&mut self, idx: usize, slot: Slot) {
        let n = slot_count(self.buf);
        for i in (idx..n).rev() {
            let moved = read_slot(self.buf, i);
            write_slot(self.buf, i + 1, &moved);
        }
        write_slot(self.buf, idx, &slot);
        set_slot_count(self.buf, n + 1);
    }

    fn remove_slot_at(&mut self, idx: usize) {
        let n = slot_count(self.buf);
        for i in idx..n - 1 {
            let moved = read_slot(self.buf, i + 1);
            write_slot(self.buf, i, &moved);
        }
        set_slot_count(self.buf, n - 1);
    }

    /// Attempts to store `key -> value`. Returns `Ok(false)` if the page is
    /// full even after defragmentation; the caller must reorganize (move
    /// entries to a child/overflow page) and retry.
    pub fn try_set(&mut self, key: &NibblePath<'_>, value: &[u8]) -> bool {
        let needed = entry_total_size(key.len() as u16, value.len());
        if let Ok(idx) = self.find(key) {
            let slot = read_slot(self.buf, idx);
            let old_size = entry_total_size(slot.key_nibble_len, Self::entry_value(self.buf, slot.entry_offset as usize).len());
            self.remove_slot_at(idx);
            set_wasted(self.buf, wasted(self.buf) + old_size);
        }
        if self.free_space() < needed {
            if wasted(self.buf) > 0 {
                self.defragment();
            }
            if self.free_space() < needed {
                return false;
            }
        }
        let new_low = heap_low(self.buf) - needed;
        let (key_bytes, _) = key.to_owned_bytes();
        let klen = key_bytes.len();
        self.buf[new_low] = klen as u8;
        self.buf[new_low + 1..new_low + 1 + klen].copy_from_slice(&key_bytes);
        let vlen_off = new_low + 1 + klen;
        self.buf[vlen_off..vlen_off + 2].copy_from_slice(&(value.len() as u16).to_le_bytes());
        self.buf[vlen_off + 2..vlen_off + 2 + value.len()].copy_from_slice(value);
        set_heap_low(self.buf, new_low);
        let idx = match self.find(key) {
            Ok(_) => unreachable!("just removed this key"),
            Err(idx) => idx,
        };
        self.insert_slot_at(
            idx,
            Slot {
                fingerprint: key.fingerprint(),
                key_nibble_len: key.len() as u16,
                entry_offset: new_low as u16,
            },
        );
        true
    }

    pub fn try_get(&self, key: &NibblePath<'_>) -> Option<&[u8]> {
        match self.find(key) {
            Ok(idx) => {
                let slot = read_slot(self.buf, idx);
                let value = Self::entry_value(self.buf, slot.entry_offset as usize);
                if value.is_empty() {
                    None
                } else {
                    Some(value)
                }
            }
            Err(_) => None,
        }
    }

    /// True if the key is present at all, tombstone or not.
    pub fn contains_key(&self, key: &NibblePath<'_>) -> bool {
        self.find(key).is_ok()
    }

    /// Writes a tombstone (empty value) for `key`. Returns `false` if the
    /// key was never present and there is no room to record the tombstone.
    pub fn delete(&mut self, key: &NibblePath<'_>) -> bool {
        self.try_set(key, &[])
    }

    /// Tombstones every key starting with `prefix`.
    pub fn delete_by_prefix(&mut self, prefix: &NibblePath<'_>) {
        let matches: Vec<OwnedNibblePath> = self
            .enumerate_all()
            .into_iter()
            .filter(|(k, _)| k.as_view().starts_with(prefix))
            .map(|(k, _)| k)
            .collect();
        for key in matches {
            self.delete(&key.as_view());
        }
    }

    /// All entries, in slot (fingerprint) order, tombstones included.
    pub fn enumerate_all(&self) -> Vec<(OwnedNibblePath, Vec<u8>)> {
        let n = slot_count(self.buf);
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let slot = read_slot(self.buf, i);
            let key_bytes = Self::entry_key(self.buf, slot.entry_offset as usize).to_vec();
            let value = Self::entry_value(self.buf, slot.entry_offset as usize).to_vec();
            let key = NibblePath::from_bytes(&key_bytes).slice_to(slot.key_nibble_len as usize);
            out.push((OwnedNibblePath::from_view(&key), value));
        }
        out
    }

    /// Entries whose first nibble equals `n` (used to flush a bucket down
    /// to a child page).
    pub fn enumerate_nibble(&self, n: u8) -> Vec<(OwnedNibblePath, Vec<u8>)> {
        self.enumerate_all()
            .into_iter()
            .filter(|(k, _)| !k.is_empty() && k.as_view().first_nibble() == n)
            .collect()
    }

    /// Physically removes (not tombstones) every entry whose first nibble
    /// equals `n`. Used after a fan-out bucket has been flushed down to a
    /// child page, where the moved keys no longer need local shadowing.
    pub fn remove_nibble(&mut self, n: u8) {
        let matches: Vec<OwnedNibblePath> = self
            .enumerate_all()
            .into_iter()
            .filter(|(k, _)| !k.is_empty() && k.as_view().first_nibble() == n)
            .map(|(k, _)| k)
            .collect();
        for key in matches {
            if let Ok(idx) = self.find(&key.as_view()) {
                let slot = read_slot(self.buf, idx);
                let size = entry_total_size(slot.key_nibble_len, Self::entry_value(self.buf, slot.entry_offset as usize).len());
                self.remove_slot_at(idx);
                set_wasted(self.buf, wasted(self.buf) + size);
            }
        }
    }

    /// Count of live (non-tombstone) keys by first nibble.
    pub fn gather_count_stats_1_nibble(&self) -> [u32; 16] {
        let mut stats = [0u32; 16];
        for (key, value) in self.enumerate_all() {
            if !value.is_empty() && !key.is_empty() {
                stats[key.as_view().first_nibble() as usize] += 1;
            }
        }
        stats
    }

    /// Total on-page size of live keys by first nibble, used to pick which
    /// nibble to flush down when a page overfills.
    pub fn gather_size_stats_1_nibble(&self) -> [u32; 16] {
        let mut stats = [0u32; 16];
        for (key, value) in self.enumerate_all() {
            if !value.is_empty() && !key.is_empty() {
                stats[key.as_view().first_nibble() as usize] +=
                    entry_total_size(key.len() as u16, value.len()) as u32;
            }
        }
        stats
    }

    pub fn clear(&mut self) {
        set_slot_count(self.buf, 0);
        set_heap_low(self.buf, self.capacity_bytes());
        set_wasted(self.buf, 0);
    }

    /// Repacks the heap, dropping the slack left by updates and deletes.
    /// Slot order (sorted by fingerprint) is preserved.
    fn defragment(&mut self) {
        let entries = self.enumerate_all();
        self.clear();
        for (key, value) in entries {
            let needed = entry_total_size(key.len() as u16, value.len());
            let new_low = heap_low(self.buf) - needed;
            let (key_bytes, _) = key.as_view().to_owned_bytes();
            let klen = key_bytes.len();
            self.buf[new_low] = klen as u8;
            self.buf[new_low + 1..new_low + 1 + klen].copy_from_slice(&key_bytes);
            let vlen_off = new_low + 1 + klen;
            self.buf[vlen_off..vlen_off + 2].copy_from_slice(&(value.len() as u16).to_le_bytes());
            self.buf[vlen_off + 2..vlen_off + 2 + value.len()].copy_from_slice(&value);
            set_heap_low(self.buf, new_low);
            let n = slot_count(self.buf);
            write_slot(
                self.buf,
                n,
                &Slot {
                    fingerprint: key.as_view().fingerprint(),
                    key_nibble_len: key.len() as u16,
                    entry_offset: new_low as u16,
                },
            );
            set_slot_count(self.buf, n + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(buf: &mut [u8]) -> SlottedArray<'_> {
        let mut arr = SlottedArray::wrap(buf);
        arr.clear();
        arr
    }

    #[test]
    fn set_then_get_round_trips() {
        let mut buf = vec![0u8; 512];
        let mut arr = fresh(&mut buf);
        let key_bytes = [0x12, 0x34];
        let key = NibblePath::from_bytes(&key_bytes);
        assert!(arr.try_set(&key, b"hello"));
        assert_eq!(arr.try_get(&key), Some(&b"hello"[..]));
    }

    #[test]
    fn overwrite_replaces_value() {
        let mut buf = vec![0u8; 512];
        let mut arr = fresh(&mut buf);
        let key_bytes = [0xAB];
        let key = NibblePath::from_bytes(&key_bytes);
        assert!(arr.try_set(&key, b"v1"));
        assert!(arr.try_set(&key, b"v2-longer"));
        assert_eq!(arr.try_get(&key), Some(&b"v2-longer"[..]));
        assert_eq!(arr.len(), 1);
    }

    #[test]
    fn delete_leaves_tombstone_not_absence() {
        let mut buf = vec![0u8; 512];
        let mut arr = fresh(&mut buf);
        let key_bytes = [0x01];
        let key = NibblePath::from_bytes(&key_bytes);
        assert!(arr.try_set(&key, b"x"));
        assert!(arr.delete(&key));
        assert_eq!(arr.try_get(&key), None);
        assert!(arr.contains_key(&key));
    }

    #[test]
    fn enumerate_nibble_filters_by_first_nibble() {
        let mut buf = vec![0u8; 1024];
        let mut arr = fresh(&mut buf);
        for b in [0x00u8, 0x01, 0x10, 0x11] {
            let bytes = [b];
            arr.try_set(&NibblePath::from_bytes(&bytes), &[b]);
        }
        let zeros = arr.enumerate_nibble(0);
        assert_eq!(zeros.len(), 2);
    }

    #[test]
    fn try_set_fails_when_full() {
        let mut buf = vec![0u8; 64];
        let mut arr = fresh(&mut buf);
        let mut count = 0;
        for i in 0..255u8 {
            let bytes = [i];
            if arr.try_set(&NibblePath::from_bytes(&bytes), b"0123456789") {
                count += 1;
            } else {
                break;
            }
        }
        assert!(count > 0);
        let bytes = [254u8];
        assert!(!arr.try_set(&NibblePath::from_bytes(&bytes), b"01234567890123456789"));
    }
}
