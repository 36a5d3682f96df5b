//! `PagedDb` (spec §4.6): the ring of root slots, single-writer discipline,
//! and the read-batch/write-batch entry points every caller goes through.
//!
//! Grounded on `nervusdb-v2-storage/src/engine.rs`'s `Engine` type: a
//! `parking_lot::RwLock`-guarded shared state, one `write` lock held for the
//! lifetime of a write batch, and many concurrent read batches each pinned
//! to the root that was current when they opened. That engine wraps its
//! published snapshot in an `Arc`; here the snapshot is small enough
//! (`RootPage` is a handful of `u32`s plus the abandoned list) to clone
//! outright instead.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::address::DbAddress;
use crate::batch::BatchContext;
use crate::error::{Error, Result};
use crate::metrics::{MetricsCollector, NoopMetrics};
use crate::page::{CommitOptions, PageManager, PageType};
use crate::root_page::{Key, RootPage};

/// Tuning knobs for a [`PagedDb`] (spec §6's configuration surface).
#[derive(Debug, Clone, Copy)]
pub struct DbOptions {
    /// Number of root slots kept in the ring, and thus the number of past
    /// batches whose pages cannot be reclaimed even with no readers open.
    /// Spec §3's invariant floor (`current_write_batch_id - HistoryDepth`).
    pub history_depth: usize,
    /// Durability level used when a caller commits without specifying one.
    pub default_commit_options: CommitOptions,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            history_depth: 8,
            default_commit_options: CommitOptions::FlushDataAndRoot,
        }
    }
}

struct Ring {
    /// `(batch_id, decoded root)` for each ring slot, indexed by slot
    /// number, not by batch id — `current_idx` points at the newest one.
    roots: Vec<(u32, RootPage)>,
    current_idx: usize,
    next_batch_id: u32,
    write_open: bool,
    /// Refcounted set of batch ids with an open [`Reader`]; the smallest key
    /// bounds how far back abandoned pages are safe to reclaim.
    open_readers: BTreeMap<u32, u32>,
}

/// Ring buffer of root slots; opens read batches and the (single) write
/// batch (spec §4.6).
pub struct PagedDb {
    manager: Arc<dyn PageManager>,
    options: DbOptions,
    capacity_pages: u32,
    ring: Arc<RwLock<Ring>>,
    metrics: Arc<dyn MetricsCollector>,
}

impl PagedDb {
    /// Opens (or initializes, if the manager's root slots are blank) a
    /// database backed by `manager`. `capacity_pages` bounds the bump
    /// allocator; the ring occupies addresses `0..history_depth.max(2)`.
    pub fn open(manager: Arc<dyn PageManager>, options: DbOptions, capacity_pages: u32) -> Result<Self> {
        let ring_size = options.history_depth.max(2);
        let mut roots = Vec::with_capacity(ring_size);
        let mut current_idx = 0usize;
        let mut newest_batch_id = 0u32;
        let mut any_existing = false;

        for i in 0..ring_size {
            let page = manager.get_at(DbAddress::new(i as u32))?;
            // `batch_id == 0` means the slot was never written: a blank
            // page's `page_type` byte happens to equal `PageType::Root`'s
            // discriminant (0), so freshness is decided by batch id, not
            // by whether decoding succeeds.
            match page.page_type() {
                Ok(PageType::Root) if page.batch_id() > 0 => {
                    let batch_id = page.batch_id();
                    if !any_existing || batch_id >= newest_batch_id {
                        newest_batch_id = batch_id;
                        current_idx = i;
                    }
                    any_existing = true;
                    roots.push((batch_id, RootPage::from_page(&page)?));
                }
                _ => roots.push((0, RootPage::empty(DbAddress::new(ring_size as u32)))),
            }
        }

        let next_batch_id = if any_existing { newest_batch_id + 1 } else { 1 };
        info!(ring_size, next_batch_id, "opened paged db");

        Ok(Self {
            manager,
            options,
            capacity_pages,
            ring: Arc::new(RwLock::new(Ring {
                roots,
                current_idx,
                next_batch_id,
                write_open: false,
                open_readers: BTreeMap::new(),
            })),
            metrics: Arc::new(NoopMetrics),
        })
    }

    /// Attaches a metrics collector (spec §6); the core reports into it
    /// from `commit` and from every read/write batch it opens.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    /// The batch id that will be assigned to the next write batch.
    pub fn next_batch_id(&self) -> u32 {
        self.ring.read().next_batch_id
    }

    /// The live root slot's `(batch_id, decoded root)`, used by
    /// [`crate::multihead`] to seed a fresh [`crate::multihead::Head`].
    pub(crate) fn current_root(&self) -> (u32, RootPage) {
        let ring = self.ring.read();
        ring.roots[ring.current_idx].clone()
    }

    pub(crate) fn manager(&self) -> Arc<dyn PageManager> {
        self.manager.clone()
    }

    pub(crate) fn capacity_pages(&self) -> u32 {
        self.capacity_pages
    }

    /// The oldest abandoning batch id that is still unsafe to reclaim: it
    /// is protected either by the retained-history window or by an open
    /// reader, whichever reaches further back.
    fn reuse_floor(ring: &Ring, history_depth: usize) -> u32 {
        let window_floor = ring.next_batch_id.saturating_sub(history_depth as u32);
        let reader_floor = ring.open_readers.keys().next().copied().unwrap_or(u32::MAX);
        window_floor.min(reader_floor)
    }

    /// Opens the single write batch. Fails with [`Error::ConcurrentWriteBatch`]
    /// if one is already open (spec's Non-goal: no multi-writer concurrency).
    pub fn begin_next_batch(&self) -> Result<WriteBatch> {
        let mut ring = self.ring.write();
        if ring.write_open {
            return Err(Error::ConcurrentWriteBatch);
        }
        ring.write_open = true;

        let (_, root) = ring.roots[ring.current_idx].clone();
        let batch_id = ring.next_batch_id;
        let min_batch_id = Self::reuse_floor(&ring, self.options.history_depth);
        drop(ring);

        debug!(batch_id, min_batch_id, "opened write batch");
        Ok(WriteBatch {
            ctx: Some(BatchContext::new(self.manager.clone(), batch_id, min_batch_id, root, self.capacity_pages)),
            ring: self.ring.clone(),
            metrics: self.metrics.clone(),
        })
    }

    /// Commits `batch`, writes the new root into the next ring slot, and
    /// advances the ring. Always releases the write lock, even on failure.
    pub fn commit(&self, mut batch: WriteBatch, options: Option<CommitOptions>) -> Result<u32> {
        let options = options.unwrap_or(self.options.default_commit_options);
        let started = Instant::now();
        let ctx = batch.take_ctx();
        let batch_id = ctx.batch_id();
        let result = ctx.commit(options);

        let mut ring = self.ring.write();
        ring.write_open = false;
        let root_page = result?;

        let ring_size = ring.roots.len();
        let next_idx = (ring.current_idx + 1) % ring_size;
        self.manager.write_root(DbAddress::new(next_idx as u32), &root_page, options)?;
        ring.roots[next_idx] = (batch_id, RootPage::from_page(&root_page)?);
        ring.current_idx = next_idx;
        ring.next_batch_id = batch_id + 1;
        let reader_floor = ring.open_readers.keys().next().copied().unwrap_or(batch_id);
        drop(ring);
        self.metrics.record_commit(started.elapsed());
        self.metrics.record_last_written_batch_id(batch_id);
        self.metrics.record_lowest_reader_batch_id(reader_floor);
        debug!(batch_id, "committed write batch");
        Ok(batch_id)
    }

    /// Opens a read batch pinned to the current root.
    pub fn begin_read_only_batch(&self) -> Reader {
        let mut ring = self.ring.write();
        let (batch_id, root) = ring.roots[ring.current_idx].clone();
        *ring.open_readers.entry(batch_id).or_insert(0) += 1;
        drop(ring);
        Reader::new(self.manager.clone(), batch_id, root, self.ring.clone(), self.metrics.clone())
    }

    /// Opens a read batch pinned to the historical root matching
    /// `state_hash`, if it is still retained in the ring. Returns
    /// [`Error::UnknownStateHash`] otherwise (spec §4.6).
    pub fn begin_read_only_batch_by_hash(&self, state_hash: [u8; 32]) -> Result<Reader> {
        let mut ring = self.ring.write();
        let found = ring.roots.iter().find(|(_, root)| root.state_hash() == state_hash);
        let (batch_id, root) = found.map(|(b, r)| (*b, r.clone())).ok_or(Error::UnknownStateHash)?;
        *ring.open_readers.entry(batch_id).or_insert(0) += 1;
        drop(ring);
        Ok(Reader::new(self.manager.clone(), batch_id, root, self.ring.clone(), self.metrics.clone()))
    }
}

/// The single open write transaction. Dropping it without calling
/// [`PagedDb::commit`] discards all staged pages and releases the write
/// lock, so the batch can simply be abandoned on an error path.
pub struct WriteBatch {
    ctx: Option<BatchContext>,
    ring: Arc<RwLock<Ring>>,
    metrics: Arc<dyn MetricsCollector>,
}

impl WriteBatch {
    fn take_ctx(&mut self) -> BatchContext {
        self.ctx.take().expect("write batch already consumed by commit")
    }

    pub fn get(&mut self, key: &Key<'_>) -> Result<Option<Vec<u8>>> {
        self.metrics.record_read();
        self.ctx.as_mut().expect("write batch already consumed").try_get(key)
    }

    pub fn set(&mut self, key: &Key<'_>, value: &[u8]) -> Result<()> {
        self.metrics.record_write();
        self.ctx.as_mut().expect("write batch already consumed").set_raw(key, value)
    }

    pub fn destroy(&mut self, account: &[u8; 32]) -> Result<()> {
        self.ctx.as_mut().expect("write batch already consumed").destroy(account)
    }

    pub fn delete_by_prefix(&mut self, prefix: crate::nibble::NibblePath<'_>) -> Result<()> {
        self.ctx.as_mut().expect("write batch already consumed").delete_by_prefix(prefix)
    }

    pub fn set_metadata(&mut self, block_number: u32, state_hash: [u8; 32]) -> Result<()> {
        self.ctx.as_mut().expect("write batch already consumed").set_metadata(block_number, state_hash)
    }

    pub fn batch_id(&self) -> u32 {
        self.ctx.as_ref().expect("write batch already consumed").batch_id()
    }

    /// Stages a page produced elsewhere (the multi-head finalizer replaying
    /// a [`crate::multihead::ProposedBatch`]) directly into this batch.
    pub(crate) fn stage(&mut self, addr: DbAddress, page: &crate::page::Page) {
        self.ctx.as_mut().expect("write batch already consumed").save(addr, page);
    }

    /// Overwrites this batch's working root wholesale. Used by the
    /// multi-head finalizer, whose [`crate::multihead::ProposedBatch`]
    /// already carries a fully formed root descended from the same
    /// lineage; see DESIGN.md for the assumption this relies on.
    pub(crate) fn replace_root(&mut self, root: RootPage) {
        self.ctx.as_mut().expect("write batch already consumed").root = root;
    }
}

impl Drop for WriteBatch {
    fn drop(&mut self) {
        if self.ctx.is_some() {
            self.ring.write().write_open = false;
        }
    }
}

/// A read-only transaction pinned to the root that was current when it was
/// opened. Never observes pages written by a later batch, even after that
/// batch commits (spec §3's read-isolation invariant).
pub struct Reader {
    ctx: BatchContext,
    batch_id: u32,
    ring: Arc<RwLock<Ring>>,
    metrics: Arc<dyn MetricsCollector>,
}

impl Reader {
    fn new(manager: Arc<dyn PageManager>, batch_id: u32, root: RootPage, ring: Arc<RwLock<Ring>>, metrics: Arc<dyn MetricsCollector>) -> Self {
        Self {
            ctx: BatchContext::new(manager, batch_id, batch_id, root, 0),
            batch_id,
            ring,
            metrics,
        }
    }

    pub fn get(&mut self, key: &Key<'_>) -> Result<Option<Vec<u8>>> {
        self.metrics.record_read();
        self.ctx.try_get(key)
    }

    pub fn block_number(&self) -> u32 {
        self.ctx.root.block_number()
    }

    pub fn state_hash(&self) -> [u8; 32] {
        self.ctx.root.state_hash()
    }

    pub fn batch_id(&self) -> u32 {
        self.batch_id
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        let mut ring = self.ring.write();
        if let Some(count) = ring.open_readers.get_mut(&self.batch_id) {
            *count -= 1;
            if *count == 0 {
                ring.open_readers.remove(&self.batch_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_manager::FilePageManager;
    use crate::nibble::NibblePath;
    use tempfile::tempdir;

    fn open_db(dir: &std::path::Path, history_depth: usize) -> PagedDb {
        let manager: Arc<dyn PageManager> = Arc::new(FilePageManager::open(dir.join("db.paprika"), 4096).unwrap());
        PagedDb::open(manager, DbOptions { history_depth, ..Default::default() }, 4096).unwrap()
    }

    #[test]
    fn set_then_read_back_after_commit() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path(), 4);

        let mut batch = db.begin_next_batch().unwrap();
        let key_bytes = [0xABu8; 32];
        let key = Key::State(NibblePath::from_bytes(&key_bytes));
        batch.set(&key, b"hello").unwrap();
        db.commit(batch, None).unwrap();

        let mut reader = db.begin_read_only_batch();
        let key = Key::State(NibblePath::from_bytes(&key_bytes));
        assert_eq!(reader.get(&key).unwrap(), Some(b"hello".to_vec()));
    }

    #[test]
    fn second_writer_is_rejected_while_first_is_open() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path(), 4);
        let _first = db.begin_next_batch().unwrap();
        assert!(matches!(db.begin_next_batch(), Err(Error::ConcurrentWriteBatch)));
    }

    #[test]
    fn dropping_a_batch_without_committing_releases_the_write_lock() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path(), 4);
        {
            let _batch = db.begin_next_batch().unwrap();
        }
        assert!(db.begin_next_batch().is_ok());
    }

    #[test]
    fn reader_keeps_observing_its_own_snapshot_after_a_later_commit() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path(), 4);
        let key_bytes = [0x11u8; 32];

        let mut batch = db.begin_next_batch().unwrap();
        batch.set(&Key::State(NibblePath::from_bytes(&key_bytes)), b"v1").unwrap();
        db.commit(batch, None).unwrap();

        let mut reader = db.begin_read_only_batch();

        let mut batch = db.begin_next_batch().unwrap();
        batch.set(&Key::State(NibblePath::from_bytes(&key_bytes)), b"v2").unwrap();
        db.commit(batch, None).unwrap();

        assert_eq!(reader.get(&Key::State(NibblePath::from_bytes(&key_bytes))).unwrap(), Some(b"v1".to_vec()));
        let mut fresh = db.begin_read_only_batch();
        assert_eq!(fresh.get(&Key::State(NibblePath::from_bytes(&key_bytes))).unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn unknown_state_hash_is_an_error() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path(), 4);
        assert!(matches!(db.begin_read_only_batch_by_hash([0xFFu8; 32]), Err(Error::UnknownStateHash)));
    }

    #[test]
    fn block_metadata_round_trips_through_a_commit() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path(), 4);

        let mut batch = db.begin_next_batch().unwrap();
        batch.set_metadata(42, [0x7Au8; 32]).unwrap();
        db.commit(batch, None).unwrap();

        let reader = db.begin_read_only_batch();
        assert_eq!(reader.block_number(), 42);
        assert_eq!(reader.state_hash(), [0x7Au8; 32]);
    }
}
