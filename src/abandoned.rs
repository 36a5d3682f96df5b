//! Persistent free list of pages abandoned by historical batches
//! (spec §4.4, `AbandonedList` / `AbandonedPage`).
//!
//! A freed page cannot be reused immediately: readers opened against older
//! roots may still be walking it. Each batch's frees are chained into an
//! `AbandonedPage` list keyed by the batch id that produced them; a page
//! becomes a candidate for reuse once that batch id is older than every
//! live reader.

use crate::address::DbAddress;
use crate::error::Result;
use crate::page::{Page, PageManager};

const OFF_TOTAL_COUNT: usize = 0;
const OFF_NEXT: usize = 4;
const OFF_ENTRY_COUNT: usize = 8;
const ENTRIES_START: usize = 10;
const ENTRY_SIZE: usize = 8;

/// A chained stack of freed page addresses, all abandoned by the same
/// batch. Consecutive addresses are packed into a single `(start, run_len)`
/// entry rather than one slot per address.
pub struct AbandonedPageView<'a> {
    buf: &'a mut [u8],
}

impl<'a> AbandonedPageView<'a> {
    pub fn wrap(buf: &'a mut [u8]) -> Self {
        Self { buf }
    }

    pub fn init(buf: &mut [u8]) {
        buf[OFF_TOTAL_COUNT..OFF_TOTAL_COUNT + 4].copy_from_slice(&0i32.to_le_bytes());
        buf[OFF_NEXT..OFF_NEXT + 4].copy_from_slice(&DbAddress::NULL.raw().to_le_bytes());
        buf[OFF_ENTRY_COUNT..OFF_ENTRY_COUNT + 2].copy_from_slice(&0u16.to_le_bytes());
    }

    pub fn count(&self) -> i32 {
        i32::from_le_bytes(self.buf[OFF_TOTAL_COUNT..OFF_TOTAL_COUNT + 4].try_into().unwrap())
    }

    fn set_count(&mut self, v: i32) {
        self.buf[OFF_TOTAL_COUNT..OFF_TOTAL_COUNT + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub fn next(&self) -> DbAddress {
        DbAddress::new(u32::from_le_bytes(self.buf[OFF_NEXT..OFF_NEXT + 4].try_into().unwrap()))
    }

    pub fn attach_tail(&mut self, addr: DbAddress) {
        self.buf[OFF_NEXT..OFF_NEXT + 4].copy_from_slice(&addr.raw().to_le_bytes());
    }

    fn entry_count(&self) -> usize {
        u16::from_le_bytes(self.buf[OFF_ENTRY_COUNT..OFF_ENTRY_COUNT + 2].try_into().unwrap()) as usize
    }

    fn set_entry_count(&mut self, n: usize) {
        self.buf[OFF_ENTRY_COUNT..OFF_ENTRY_COUNT + 2].copy_from_slice(&(n as u16).to_le_bytes());
    }

    fn entry_off(i: usize) -> usize {
        ENTRIES_START + i * ENTRY_SIZE
    }

    fn read_entry(&self, i: usize) -> (u32, u32) {
        let o = Self::entry_off(i);
        (
            u32::from_le_bytes(self.buf[o..o + 4].try_into().unwrap()),
            u32::from_le_bytes(self.buf[o + 4..o + 8].try_into().unwrap()),
        )
    }

    fn write_entry(&mut self, i: usize, start: u32, run_len: u32) {
        let o = Self::entry_off(i);
        self.buf[o..o + 4].copy_from_slice(&start.to_le_bytes());
        self.buf[o + 4..o + 8].copy_from_slice(&run_len.to_le_bytes());
    }

    fn capacity_entries(&self) -> usize {
        (self.buf.len() - ENTRIES_START) / ENTRY_SIZE
    }

    /// Appends `addr` to the chain, extending the last run if contiguous.
    /// Returns `false` if the page has no room for a new run.
    pub fn push(&mut self, addr: DbAddress) -> bool {
        let n = self.entry_count();
        if n > 0 {
            let (start, run_len) = self.read_entry(n - 1);
            if start + run_len == addr.raw() {
                self.write_entry(n - 1, start, run_len + 1);
                self.set_count(self.count() + 1);
                return true;
            }
        }
        if n >= self.capacity_entries() {
            return false;
        }
        self.write_entry(n, addr.raw(), 1);
        self.set_entry_count(n + 1);
        self.set_count(self.count() + 1);
        true
    }

    pub fn try_peek(&self) -> Option<DbAddress> {
        let n = self.entry_count();
        if n == 0 {
            return None;
        }
        let (start, run_len) = self.read_entry(n - 1);
        Some(DbAddress::new(start + run_len - 1))
    }

    pub fn try_pop(&mut self) -> Option<DbAddress> {
        let n = self.entry_count();
        if n == 0 {
            return None;
        }
        let (start, run_len) = self.read_entry(n - 1);
        let popped = start + run_len - 1;
        if run_len == 1 {
            self.set_entry_count(n - 1);
        } else {
            self.write_entry(n - 1, start, run_len - 1);
        }
        self.set_count(self.count() - 1);
        Some(DbAddress::new(popped))
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

/// One ring slot: the head of a per-batch abandoned-page chain and the
/// batch id that produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Slot {
    head: DbAddress,
    batch_id: u32,
}

const SLOT_BYTES: usize = 8;

/// Inlined into [`crate::root_page::RootPage`]. Slots are kept sorted by
/// batch id, ascending, per spec §3's invariant.
#[derive(Clone)]
pub struct AbandonedList {
    slots: Vec<Slot>,
    current: DbAddress,
}

impl AbandonedList {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![
                Slot {
                    head: DbAddress::NULL,
                    batch_id: 0
                };
                capacity
            ],
            current: DbAddress::NULL,
        }
    }

    pub fn encoded_len(capacity: usize) -> usize {
        4 + capacity * SLOT_BYTES
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.current.raw().to_le_bytes());
        for (i, slot) in self.slots.iter().enumerate() {
            let o = 4 + i * SLOT_BYTES;
            buf[o..o + 4].copy_from_slice(&slot.head.raw().to_le_bytes());
            buf[o + 4..o + 8].copy_from_slice(&slot.batch_id.to_le_bytes());
        }
    }

    pub fn read_from(buf: &[u8], capacity: usize) -> Self {
        let current = DbAddress::new(u32::from_le_bytes(buf[0..4].try_into().unwrap()));
        let mut slots = Vec::with_capacity(capacity);
        for i in 0..capacity {
            let o = 4 + i * SLOT_BYTES;
            slots.push(Slot {
                head: DbAddress::new(u32::from_le_bytes(buf[o..o + 4].try_into().unwrap())),
                batch_id: u32::from_le_bytes(buf[o + 4..o + 8].try_into().unwrap()),
            });
        }
        Self { slots, current }
    }

    /// Implements spec §4.4's `try_get`. `register_for_reuse` is called for
    /// every abandoned-list page consumed along the way (it is about to be
    /// rewritten by the caller's batch and must itself eventually be freed).
    pub fn try_get(
        &mut self,
        manager: &dyn PageManager,
        batch_id: u32,
        min_batch_id: u32,
        register_for_reuse: &mut impl FnMut(DbAddress),
    ) -> Result<Option<DbAddress>> {
        loop {
            if self.current.is_null() {
                if min_batch_id <= 2 {
                    return Ok(None);
                }
                let found = self
                    .slots
                    .iter()
                    .position(|s| !s.head.is_null() && s.batch_id < min_batch_id);
                let idx = match found {
                    Some(i) => i,
                    None => return Ok(None),
                };
                let head_addr = self.slots[idx].head;
                let head_page = manager.get_at(head_addr)?;
                let next = AbandonedPageView::wrap(&mut head_page.payload().to_vec()).next();
                self.current = head_addr;
                if next.is_null() {
                    self.slots[idx].head = DbAddress::NULL;
                    self.slots[idx].batch_id = 0;
                } else {
                    self.slots[idx].head = next;
                }
            }

            let mut page = manager.get_at(self.current)?;
            if page.batch_id() != batch_id {
                register_for_reuse(self.current);
                let mut view = AbandonedPageView::wrap(page.payload_mut());
                let Some(peeked) = view.try_peek() else {
                    self.current = DbAddress::NULL;
                    continue;
                };
                if view.count() == 1 && view.next().is_null() {
                    self.current = DbAddress::NULL;
                    return Ok(Some(peeked));
                }
                // COW: copy this chain page's content to `peeked`'s slot,
                // claim that address as the new `current`, and drop the
                // entry we just consumed.
                view.try_pop();
                let mut dest = manager.get_for_writing(peeked, true)?;
                dest.as_bytes_mut().copy_from_slice(page.as_bytes());
                dest.set_batch_id(batch_id);
                self.current = peeked;
                return Ok(Some(peeked));
            } else {
                let mut view = AbandonedPageView::wrap(page.payload_mut());
                if let Some(addr) = view.try_pop() {
                    return Ok(Some(addr));
                }
                register_for_reuse(self.current);
                self.current = DbAddress::NULL;
            }
        }
    }

    /// Claims the first empty slot for a freshly built chain headed at
    /// `head_addr`. Returns `false` if every slot is occupied, in which case
    /// the caller must fall back to [`Self::youngest_slot_head`] and splice
    /// the chain onto an existing slot's tail instead.
    pub fn claim_empty_slot(&mut self, head_addr: DbAddress, batch_id: u32) -> bool {
        if let Some(idx) = self.slots.iter().position(|s| s.head.is_null()) {
            self.slots[idx] = Slot {
                head: head_addr,
                batch_id,
            };
            self.resort();
            true
        } else {
            false
        }
    }

    /// The head address of the slot with the highest (youngest) batch id,
    /// used when the list is full and a new chain must be attached as a
    /// tail rather than occupy its own slot.
    pub fn youngest_slot_head(&self) -> Option<DbAddress> {
        self.slots.iter().max_by_key(|s| s.batch_id).map(|s| s.head)
    }

    fn resort(&mut self) {
        self.slots.sort_by(|a, b| match (a.head.is_null(), b.head.is_null()) {
            (true, true) => std::cmp::Ordering::Equal,
            (true, false) => std::cmp::Ordering::Greater,
            (false, true) => std::cmp::Ordering::Less,
            (false, false) => a.batch_id.cmp(&b.batch_id),
        });
    }
}

/// Packs `addresses` (sorted ascending) into a chain of `AbandonedPage`s,
/// all stamped with `batch_id`, calling `allocate` for each page needed.
/// Returns the chain in head-to-tail order; the caller is responsible for
/// staging the returned pages and linking the chain into an
/// [`AbandonedList`] slot.
pub fn pack_abandoned_chain(
    addresses: &[DbAddress],
    allocate: &mut impl FnMut() -> Result<(Page, DbAddress)>,
) -> Result<Vec<(Page, DbAddress)>> {
    let mut pages: Vec<(Page, DbAddress)> = Vec::new();
    if addresses.is_empty() {
        return Ok(pages);
    }
    let (mut page, mut addr) = allocate()?;
    AbandonedPageView::init(page.payload_mut());
    for &a in addresses {
        if !AbandonedPageView::wrap(page.payload_mut()).push(a) {
            pages.push((page, addr));
            let (next_page, next_addr) = allocate()?;
            AbandonedPageView::wrap(pages.last_mut().unwrap().0.payload_mut()).attach_tail(next_addr);
            page = next_page;
            addr = next_addr;
            AbandonedPageView::init(page.payload_mut());
            AbandonedPageView::wrap(page.payload_mut()).push(a);
        }
    }
    pages.push((page, addr));
    Ok(pages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_pop_pack_contiguous_runs() {
        let mut buf = vec![0u8; 256];
        AbandonedPageView::init(&mut buf);
        let mut view = AbandonedPageView::wrap(&mut buf);
        view.push(DbAddress::new(10));
        view.push(DbAddress::new(11));
        view.push(DbAddress::new(12));
        assert_eq!(view.count(), 3);
        assert_eq!(view.try_peek(), Some(DbAddress::new(12)));
        assert_eq!(view.try_pop(), Some(DbAddress::new(12)));
        assert_eq!(view.try_pop(), Some(DbAddress::new(11)));
        assert_eq!(view.try_pop(), Some(DbAddress::new(10)));
        assert!(view.try_pop().is_none());
    }

    #[test]
    fn non_contiguous_push_starts_new_run() {
        let mut buf = vec![0u8; 256];
        AbandonedPageView::init(&mut buf);
        let mut view = AbandonedPageView::wrap(&mut buf);
        view.push(DbAddress::new(10));
        view.push(DbAddress::new(50));
        assert_eq!(view.count(), 2);
        assert_eq!(view.try_pop(), Some(DbAddress::new(50)));
        assert_eq!(view.try_pop(), Some(DbAddress::new(10)));
    }

    #[test]
    fn slots_round_trip_through_bytes() {
        let mut list = AbandonedList::new(4);
        list.slots[0] = Slot {
            head: DbAddress::new(7),
            batch_id: 3,
        };
        let mut buf = vec![0u8; AbandonedList::encoded_len(4)];
        list.write_to(&mut buf);
        let back = AbandonedList::read_from(&buf, 4);
        assert_eq!(back.slots[0].head, DbAddress::new(7));
        assert_eq!(back.slots[0].batch_id, 3);
    }
}
