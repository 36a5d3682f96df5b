//! Runtime state for one write transaction (spec §4.5, `Batch context`).
//!
//! `BatchContext` is the single mutable handle threaded through every Set/
//! Get/DeleteByPrefix call during a write batch. It owns the bump
//! allocator cursor, the abandoned-page free list, the COW bookkeeping
//! (`written`, `abandoned`, `reused_immediately`), the account id cache, and
//! the working copy of the root page. Trie page operations (`crate::trie`)
//! and root-level routing (`crate::root_page`) take `&mut BatchContext`
//! rather than owning any of this state themselves, mirroring the single
//! write-lock-holder pattern of `nervusdb-v2-storage/src/engine.rs`'s
//! `WriteTxn`.
//!
//! Mutation contract: a page obtained from [`BatchContext::get_new_page`] or
//! [`BatchContext::get_writable_copy`] is a private, owned buffer. Mutating
//! its payload in place does nothing until [`BatchContext::save`] stages it;
//! [`BatchContext::get_at`] always checks staged pages first so a batch
//! observes its own writes before they are durable.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::abandoned::pack_abandoned_chain;
use crate::address::DbAddress;
use crate::error::{Error, Result};
use crate::page::{CommitOptions, Page, PageManager, PageType, PAGE_HEADER_SIZE};
use crate::root_page::RootPage;

pub struct BatchContext {
    pub(crate) manager: Arc<dyn PageManager>,
    pub(crate) batch_id: u32,
    pub(crate) reuse_pages_older_than_batch_id: u32,
    pub(crate) root: RootPage,
    capacity: u32,
    written: HashMap<DbAddress, Page>,
    newly_abandoned: Vec<DbAddress>,
    reused_immediately: Vec<DbAddress>,
    id_cache: HashMap<[u8; 32], u32>,
    disposed: bool,
}

impl BatchContext {
    pub(crate) fn new(
        manager: Arc<dyn PageManager>,
        batch_id: u32,
        reuse_pages_older_than_batch_id: u32,
        root: RootPage,
        capacity: u32,
    ) -> Self {
        Self {
            manager,
            batch_id,
            reuse_pages_older_than_batch_id,
            root,
            capacity,
            written: HashMap::new(),
            newly_abandoned: Vec::new(),
            reused_immediately: Vec::new(),
            id_cache: HashMap::new(),
            disposed: false,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.disposed {
            Err(Error::BatchClosed)
        } else {
            Ok(())
        }
    }

    pub fn batch_id(&self) -> u32 {
        self.batch_id
    }

    pub fn manager(&self) -> &dyn PageManager {
        self.manager.as_ref()
    }

    /// Reads a page, preferring this batch's own staged copy over the
    /// manager's durable view.
    pub fn get_at(&self, addr: DbAddress) -> Result<Page> {
        self.check_open()?;
        if let Some(page) = self.written.get(&addr) {
            return Ok(page.clone());
        }
        self.manager.get_at(addr)
    }

    /// Allocates a fresh page of type `ty`, preferring (in order) a page
    /// released earlier in this same batch, then a page reclaimed from the
    /// abandoned list, then a fresh bump allocation. The page is staged
    /// immediately; mutate it and call [`Self::save`] to persist changes.
    pub fn get_new_page(&mut self, ty: PageType) -> Result<(Page, DbAddress)> {
        self.check_open()?;

        let addr = if let Some(addr) = self.reused_immediately.pop() {
            trace!(addr = addr.raw(), "reused_immediately page handed out");
            addr
        } else if let Some(addr) = self.try_reclaim_abandoned()? {
            trace!(addr = addr.raw(), "abandoned page reclaimed");
            addr
        } else {
            let addr = self.root.bump_next_free_page(self.capacity)?;
            trace!(addr = addr.raw(), "bump-allocated a fresh page");
            addr
        };

        let mut page = self.manager.get_for_writing(addr, true)?;
        page.init(ty, self.batch_id);
        self.written.insert(addr, page.clone());
        Ok((page, addr))
    }

    fn try_reclaim_abandoned(&mut self) -> Result<Option<DbAddress>> {
        let mut newly = Vec::new();
        let result = self.root.abandoned_list_mut().try_get(
            self.manager.as_ref(),
            self.batch_id,
            self.reuse_pages_older_than_batch_id,
            &mut |a| newly.push(a),
        )?;
        self.newly_abandoned.extend(newly);
        Ok(result)
    }

    /// If the page at `addr` already belongs to this batch, returns it
    /// unchanged. Otherwise allocates a fresh page, copies the content,
    /// assigns the current batch id, and records the source address for
    /// future reuse (once no live reader can still reach it).
    pub fn get_writable_copy(&mut self, addr: DbAddress) -> Result<(Page, DbAddress)> {
        self.check_open()?;
        let page = self.get_at(addr)?;
        if page.batch_id() == self.batch_id {
            return Ok((page, addr));
        }
        let ty = page.page_type().unwrap_or(PageType::Data);
        let (mut new_page, new_addr) = self.get_new_page(ty)?;
        new_page.as_bytes_mut()[PAGE_HEADER_SIZE..].copy_from_slice(&page.as_bytes()[PAGE_HEADER_SIZE..]);
        new_page.set_level(page.level());
        new_page.set_metadata(page.metadata());
        self.written.insert(new_addr, new_page.clone());
        self.register_for_future_reuse(addr, false);
        Ok((new_page, new_addr))
    }

    /// Like [`Self::get_writable_copy`], but also updates the caller's
    /// stored address in place.
    pub fn ensure_writable_copy(&mut self, addr: &mut DbAddress) -> Result<Page> {
        let (page, new_addr) = self.get_writable_copy(*addr)?;
        *addr = new_addr;
        Ok(page)
    }

    /// Stages a mutated page so it is visible to later reads in this batch
    /// and persisted at [`Self::commit`].
    pub fn save(&mut self, addr: DbAddress, page: &Page) {
        self.written.insert(addr, page.clone());
    }

    /// Schedules `addr` for eventual reuse. If `possible_immediate_reuse` is
    /// set and the page was written this very batch, it is pushed onto the
    /// cheap same-batch reuse stack instead of the abandoned list.
    pub fn register_for_future_reuse(&mut self, addr: DbAddress, possible_immediate_reuse: bool) {
        if possible_immediate_reuse && self.written.contains_key(&addr) {
            self.reused_immediately.push(addr);
            return;
        }
        #[cfg(debug_assertions)]
        if self.newly_abandoned.contains(&addr) {
            // Spec §9: duplicate registration detection is a debug-only
            // concern; surface it as an invariant violation rather than
            // silently double-freeing the address.
            panic!("page {addr:?} registered for future reuse twice in the same batch");
        }
        self.newly_abandoned.push(addr);
    }

    pub fn id_for_account(&self, account: &[u8; 32]) -> Option<u32> {
        self.id_cache.get(account).copied()
    }

    pub fn cache_account_id(&mut self, account: [u8; 32], id: u32) {
        self.id_cache.insert(account, id);
    }

    /// Looks up a previously set value. Routes through the root page's
    /// state trie or storage fan-out depending on the key shape.
    pub fn try_get(&mut self, key: &crate::root_page::Key<'_>) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        crate::root_page::root_try_get(self, key)
    }

    /// Stores `value` at `key`; an empty `value` deletes the key.
    pub fn set_raw(&mut self, key: &crate::root_page::Key<'_>, value: &[u8]) -> Result<()> {
        self.check_open()?;
        crate::root_page::root_set(self, key, value)
    }

    /// Deletes an account's id-map entry and its state-trie entry.
    pub fn destroy(&mut self, account: &[u8; 32]) -> Result<()> {
        self.check_open()?;
        crate::root_page::root_destroy(self, account)
    }

    pub fn delete_by_prefix(&mut self, prefix: crate::nibble::NibblePath<'_>) -> Result<()> {
        self.check_open()?;
        crate::root_page::root_delete_by_prefix(self, prefix)
    }

    pub fn set_metadata(&mut self, block_number: u32, state_hash: [u8; 32]) -> Result<()> {
        self.check_open()?;
        self.root.set_metadata(block_number, state_hash);
        Ok(())
    }

    /// Folds this batch's frees into the root's abandoned list, asks the
    /// page manager to persist every staged page, then marks the batch
    /// closed. Returns the new root page's bytes so
    /// [`crate::paged_db::PagedDb`] can advance its ring.
    pub fn commit(mut self, options: CommitOptions) -> Result<Page> {
        self.check_open()?;

        let mut addresses: Vec<DbAddress> = self.newly_abandoned.clone();
        addresses.sort_by_key(|a| a.raw());

        if !addresses.is_empty() {
            let chain = pack_abandoned_chain(&addresses, &mut || self.get_new_page(PageType::Abandoned))?;
            let head_addr = chain[0].1;
            for (page, addr) in &chain {
                self.save(*addr, page);
            }
            let batch_id = self.batch_id;
            if !self.root.abandoned_list_mut().claim_empty_slot(head_addr, batch_id) {
                // List full: splice the new chain onto the tail of the
                // slot with the youngest batch id. This mutates that tail
                // page's `next` pointer in place regardless of which batch
                // wrote it — the abandoned-page chain itself is not part
                // of the queryable trie the COW invariants protect, so this
                // one link update is a deliberate, documented exception.
                let mut tail_addr = self
                    .root
                    .abandoned_list_mut()
                    .youngest_slot_head()
                    .expect("abandoned list full implies at least one occupied slot");
                loop {
                    let page = self.get_at(tail_addr)?;
                    let next = crate::abandoned::AbandonedPageView::wrap(&mut page.payload().to_vec()).next();
                    if next.is_null() {
                        break;
                    }
                    tail_addr = next;
                }
                let mut tail_page = self.get_at(tail_addr)?;
                crate::abandoned::AbandonedPageView::wrap(tail_page.payload_mut()).attach_tail(head_addr);
                self.save(tail_addr, &tail_page);
            }
        }

        debug!(
            batch_id = self.batch_id,
            written = self.written.len(),
            abandoned = addresses.len(),
            "committing batch"
        );

        let pages: Vec<(DbAddress, Page)> = self.written.drain().collect();
        self.manager.write_pages(&pages, options)?;

        let root_page = self.root.to_page(self.batch_id);
        // `FlushDataOnly`/`DangerNoFlush`/`DangerNoWrite` all skip the
        // explicit fsync; they differ only in how far `write_pages` itself
        // is willing to go, which is the page manager's concern.
        if options == CommitOptions::FlushDataAndRoot {
            self.manager.flush()?;
        }
        self.disposed = true;
        Ok(root_page)
    }
}
