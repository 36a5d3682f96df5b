//! Multi-head chain (spec §4.7): an in-memory overlay that lets several
//! speculative write batches branch off a common root and be proposed,
//! read, and eventually finalized (persisted through [`PagedDb`]) or
//! dropped, without any of them touching the file until finalization.
//!
//! Grounded on `nervusdb-v2-storage/src/engine.rs`'s overlay-manager idiom
//! (the same crate that motivates [`crate::batch::BatchContext`]'s staged-
//! pages model): a [`Head`] is just another [`crate::batch::BatchContext`],
//! pointed at an [`OverlayPageManager`] that checks the youngest ancestor
//! `ProposedBatch` holding a given address before falling through to the
//! real [`PageManager`]. The spec's finalizer is a dedicated consumer task
//! reading an async queue; this crate's `PageManager` is deliberately
//! synchronous (see `crate::page::PageManager`'s doc comment), so the
//! finalizer here is a synchronous `finalize_next` the embedder drives from
//! whatever thread or scheduler it likes — the same documented sync-vs-
//! async deviation, applied consistently.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::address::DbAddress;
use crate::batch::BatchContext;
use crate::error::{Error, Result};
use crate::page::{CommitOptions, Page, PageManager};
use crate::paged_db::PagedDb;
use crate::root_page::{Key, RootPage};

/// A self-contained, reference-counted write batch proposed onto the chain
/// but not yet persisted (spec §4.7).
pub struct ProposedBatch {
    pub batch_id: u32,
    pub parent_hash: [u8; 32],
    pub state_hash: [u8; 32],
    pub root: RootPage,
    pub changes: HashMap<DbAddress, Page>,
}

/// Reads ancestor `ProposedBatch`es (youngest first) before falling through
/// to the database's own `PageManager`. Writes never reach the file: they
/// are captured in `captured` for [`Head::commit`] to fold into a new
/// `ProposedBatch`.
struct OverlayPageManager {
    ancestors: Vec<Arc<ProposedBatch>>,
    base: Arc<dyn PageManager>,
    captured: Mutex<HashMap<DbAddress, Page>>,
}

impl OverlayPageManager {
    fn new(ancestors: Vec<Arc<ProposedBatch>>, base: Arc<dyn PageManager>) -> Self {
        Self {
            ancestors,
            base,
            captured: Mutex::new(HashMap::new()),
        }
    }

    fn take_captured(&self) -> HashMap<DbAddress, Page> {
        std::mem::take(&mut *self.captured.lock())
    }
}

impl PageManager for OverlayPageManager {
    fn get_at(&self, addr: DbAddress) -> Result<Page> {
        for ancestor in self.ancestors.iter().rev() {
            if let Some(page) = ancestor.changes.get(&addr) {
                return Ok(page.clone());
            }
        }
        self.base.get_at(addr)
    }

    fn get_for_writing(&self, _addr: DbAddress, _reused: bool) -> Result<Page> {
        Ok(Page::zeroed())
    }

    fn get_address(&self, _page: &Page) -> Result<DbAddress> {
        Err(Error::InvariantViolated("overlay pages are detached buffers with no recoverable address"))
    }

    fn write_pages(&self, pages: &[(DbAddress, Page)], _options: CommitOptions) -> Result<()> {
        let mut captured = self.captured.lock();
        for (addr, page) in pages {
            captured.insert(*addr, page.clone());
        }
        Ok(())
    }

    fn write_root(&self, _addr: DbAddress, _root: &Page, _options: CommitOptions) -> Result<()> {
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// An in-progress speculative transaction: reads its ancestor chain plus
/// its own pending overrides, and can commit to produce a new
/// [`ProposedBatch`] without persisting anything (spec §4.7's "Head
/// commit").
pub struct Head {
    ctx: BatchContext,
    manager: Arc<OverlayPageManager>,
    parent_hash: [u8; 32],
}

impl Head {
    fn new(manager: Arc<OverlayPageManager>, batch_id: u32, min_batch_id: u32, root: RootPage, capacity: u32, parent_hash: [u8; 32]) -> Self {
        Self {
            ctx: BatchContext::new(manager.clone() as Arc<dyn PageManager>, batch_id, min_batch_id, root, capacity),
            manager,
            parent_hash,
        }
    }

    pub fn get(&mut self, key: &Key<'_>) -> Result<Option<Vec<u8>>> {
        self.ctx.try_get(key)
    }

    pub fn set(&mut self, key: &Key<'_>, value: &[u8]) -> Result<()> {
        self.ctx.set_raw(key, value)
    }

    pub fn destroy(&mut self, account: &[u8; 32]) -> Result<()> {
        self.ctx.destroy(account)
    }

    pub fn set_metadata(&mut self, block_number: u32, state_hash: [u8; 32]) -> Result<()> {
        self.ctx.set_metadata(block_number, state_hash)
    }

    pub fn batch_id(&self) -> u32 {
        self.ctx.batch_id()
    }

    /// Packages this head's private overrides into a `ProposedBatch`. Does
    /// not touch the file; the pages live only in the returned batch until
    /// a finalizer persists them via [`MultiHeadChain::finalize_next`].
    pub fn commit(self) -> Result<ProposedBatch> {
        let batch_id = self.ctx.batch_id();
        let root_page = self.ctx.commit(CommitOptions::DangerNoWrite)?;
        let root = RootPage::from_page(&root_page)?;
        let changes = self.manager.take_captured();
        debug!(batch_id, changes = changes.len(), "head committed a proposed batch");
        Ok(ProposedBatch {
            batch_id,
            parent_hash: self.parent_hash,
            state_hash: root.state_hash(),
            root,
            changes,
        })
    }
}

/// Registry of pending `ProposedBatch`es, indexed by `state_hash` and by
/// `batch_id`, with a finalization queue (spec §4.7).
///
/// Assumption (see DESIGN.md): a `Head`'s ancestor chain is resolved once,
/// at `new_head` time, against either another pending `ProposedBatch` or
/// the database's current root. Finalizing a batch whose base root was
/// bypassed by an intervening plain [`PagedDb::begin_next_batch`] commit
/// would silently clobber that commit; this crate leaves that
/// non-interleaving discipline to the embedder, as the original does.
pub struct MultiHeadChain {
    by_hash: RwLock<HashMap<[u8; 32], Arc<ProposedBatch>>>,
    by_batch_id: RwLock<BTreeMap<u32, Arc<ProposedBatch>>>,
    pending: Mutex<VecDeque<Arc<ProposedBatch>>>,
    auto_finalize_after: usize,
}

impl MultiHeadChain {
    /// `auto_finalize_after`: once this many batches are pending, the
    /// oldest is eligible for `finalize_next` (spec's "configured
    /// auto-finalization depth"). The embedder still calls `finalize_next`
    /// itself; this crate does not spawn a background thread.
    pub fn new(auto_finalize_after: usize) -> Self {
        Self {
            by_hash: RwLock::new(HashMap::new()),
            by_batch_id: RwLock::new(BTreeMap::new()),
            pending: Mutex::new(VecDeque::new()),
            auto_finalize_after,
        }
    }

    fn ancestor_chain(&self, parent_hash: [u8; 32]) -> Vec<Arc<ProposedBatch>> {
        let by_hash = self.by_hash.read();
        let mut chain = Vec::new();
        let mut cursor = parent_hash;
        while let Some(batch) = by_hash.get(&cursor) {
            chain.push(batch.clone());
            cursor = batch.parent_hash;
        }
        chain.reverse();
        chain
    }

    /// Opens a new speculative head branching from `parent_hash`. If
    /// `parent_hash` matches no pending batch, it must match the
    /// database's current state hash.
    pub fn new_head(&self, db: &PagedDb, parent_hash: [u8; 32]) -> Result<Head> {
        let ancestors = self.ancestor_chain(parent_hash);
        let (base_batch_id, base_root) = if let Some(youngest) = ancestors.last() {
            (youngest.batch_id, youngest.root.clone())
        } else {
            let (batch_id, root) = db.current_root();
            if root.state_hash() != parent_hash {
                return Err(Error::UnknownStateHash);
            }
            (batch_id, root)
        };

        let manager = Arc::new(OverlayPageManager::new(ancestors, db.manager()));
        let next_batch_id = base_batch_id.max(db.next_batch_id().saturating_sub(1)) + 1;
        Ok(Head::new(manager, next_batch_id, next_batch_id, base_root, db.capacity_pages(), parent_hash))
    }

    /// Registers a committed head's `ProposedBatch`, making it visible to
    /// future `new_head` calls and the finalization queue.
    pub fn register(&self, batch: ProposedBatch) -> [u8; 32] {
        let state_hash = batch.state_hash;
        let batch = Arc::new(batch);
        self.by_hash.write().insert(state_hash, batch.clone());
        self.by_batch_id.write().insert(batch.batch_id, batch.clone());
        self.pending.lock().push_back(batch);
        state_hash
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn should_auto_finalize(&self) -> bool {
        self.pending_len() >= self.auto_finalize_after && self.auto_finalize_after > 0
    }

    /// Persists the oldest pending batch through `db`'s own write-batch
    /// path (so the root swap is serialized under `db`'s write lock, per
    /// spec §4.7), then prunes it from the registries. Returns the
    /// finalized batch id, or `None` if nothing was pending.
    pub fn finalize_next(&self, db: &PagedDb) -> Result<Option<u32>> {
        let proposed = { self.pending.lock().pop_front() };
        let Some(proposed) = proposed else {
            return Ok(None);
        };

        let mut batch = db.begin_next_batch()?;
        for (addr, page) in &proposed.changes {
            batch.stage(*addr, page);
        }
        batch.replace_root(proposed.root.clone());
        let result = db.commit(batch, None);

        self.by_hash.write().remove(&proposed.state_hash);
        self.by_batch_id.write().remove(&proposed.batch_id);

        match result {
            Ok(batch_id) => {
                debug!(batch_id, "finalized proposed batch");
                Ok(Some(batch_id))
            }
            Err(err) => {
                warn!(batch_id = proposed.batch_id, error = %err, "finalization failed");
                Err(Error::FinalizerFailed(err.to_string()))
            }
        }
    }

    /// Drops every pending batch without persisting it, e.g. on shutdown
    /// (spec §4.7's "cancellation ... releases all outstanding leases").
    pub fn drop_all_pending(&self) {
        self.pending.lock().clear();
        self.by_hash.write().clear();
        self.by_batch_id.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_manager::FilePageManager;
    use crate::nibble::NibblePath;
    use crate::paged_db::DbOptions;
    use tempfile::tempdir;

    fn open_db(dir: &std::path::Path) -> PagedDb {
        let manager: Arc<dyn PageManager> = Arc::new(FilePageManager::open(dir.join("db.paprika"), 4096).unwrap());
        PagedDb::open(manager, DbOptions::default(), 4096).unwrap()
    }

    #[test]
    fn a_head_can_read_its_own_pending_write() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let chain = MultiHeadChain::new(2);

        let mut head = chain.new_head(&db, [0u8; 32]).unwrap();
        let key_bytes = [0x22u8; 32];
        head.set(&Key::State(NibblePath::from_bytes(&key_bytes)), b"speculative").unwrap();
        assert_eq!(head.get(&Key::State(NibblePath::from_bytes(&key_bytes))).unwrap(), Some(b"speculative".to_vec()));
    }

    #[test]
    fn a_child_head_sees_its_parents_committed_changes() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let chain = MultiHeadChain::new(10);

        let mut parent = chain.new_head(&db, [0u8; 32]).unwrap();
        let key_bytes = [0x33u8; 32];
        parent.set(&Key::State(NibblePath::from_bytes(&key_bytes)), b"from-parent").unwrap();
        parent.set_metadata(1, [0xAAu8; 32]).unwrap();
        let proposed = parent.commit().unwrap();
        let parent_hash = chain.register(proposed);

        let mut child = chain.new_head(&db, parent_hash).unwrap();
        assert_eq!(
            child.get(&Key::State(NibblePath::from_bytes(&key_bytes))).unwrap(),
            Some(b"from-parent".to_vec())
        );
    }

    #[test]
    fn finalizing_persists_the_batch_into_the_real_db() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let chain = MultiHeadChain::new(1);

        let mut head = chain.new_head(&db, [0u8; 32]).unwrap();
        let key_bytes = [0x44u8; 32];
        head.set(&Key::State(NibblePath::from_bytes(&key_bytes)), b"durable").unwrap();
        head.set_metadata(7, [0xBBu8; 32]).unwrap();
        let proposed = head.commit().unwrap();
        chain.register(proposed);

        assert!(chain.should_auto_finalize());
        chain.finalize_next(&db).unwrap().expect("a batch was pending");

        let mut reader = db.begin_read_only_batch();
        assert_eq!(reader.get(&Key::State(NibblePath::from_bytes(&key_bytes))).unwrap(), Some(b"durable".to_vec()));
        assert_eq!(reader.block_number(), 7);
    }

    #[test]
    fn unknown_parent_hash_is_rejected() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let chain = MultiHeadChain::new(2);
        assert!(matches!(chain.new_head(&db, [0xFFu8; 32]), Err(Error::UnknownStateHash)));
    }
}
