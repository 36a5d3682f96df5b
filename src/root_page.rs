//! The root page (spec §3, §4.3.5): the single entry point reachable from a
//! database's root-slot ring. Holds the bump-allocator cursor, the state
//! trie root, the account id map root, the storage fan-out root, block
//! metadata, and the inline [`AbandonedList`].

use crate::abandoned::AbandonedList;
use crate::address::DbAddress;
use crate::batch::BatchContext;
use crate::error::{Error, Result};
use crate::nibble::NibblePath;
use crate::page::{Page, PageType};
use crate::trie::{self, storage_fanout};

const OFF_NEXT_FREE_PAGE: usize = 0;
const OFF_ACCOUNT_COUNTER: usize = 4;
const OFF_STATE_ROOT: usize = 8;
const OFF_IDS_ROOT: usize = 12;
const OFF_STORAGE_ROOT: usize = 16;
const OFF_BLOCK_NUMBER: usize = 20;
const OFF_STATE_HASH: usize = 24;
const OFF_ABANDONED_LIST: usize = 56;

/// Ring slots in the inline [`AbandonedList`]; one slot per batch id whose
/// frees have not yet aged out, see spec §4.4.
pub const ABANDONED_LIST_SLOTS: usize = 64;

#[derive(Clone)]
pub struct RootPage {
    next_free_page: DbAddress,
    account_counter: u32,
    state_root: DbAddress,
    ids_root: DbAddress,
    storage_root: DbAddress,
    block_number: u32,
    state_hash: [u8; 32],
    abandoned_list: AbandonedList,
}

impl RootPage {
    /// A brand new, empty database: no trie content, bump allocation
    /// starting right after the root-slot ring.
    pub fn empty(first_free_page: DbAddress) -> Self {
        Self {
            next_free_page: first_free_page,
            account_counter: 0,
            state_root: DbAddress::NULL,
            ids_root: DbAddress::NULL,
            storage_root: DbAddress::NULL,
            block_number: 0,
            state_hash: [0u8; 32],
            abandoned_list: AbandonedList::new(ABANDONED_LIST_SLOTS),
        }
    }

    pub fn from_page(page: &Page) -> Result<Self> {
        if page.page_type()? != PageType::Root {
            return Err(Error::InvariantViolated("expected a root page"));
        }
        let payload = page.payload();
        let read_addr = |off: usize| DbAddress::new(u32::from_le_bytes(payload[off..off + 4].try_into().unwrap()));
        let abandoned_end = OFF_ABANDONED_LIST + AbandonedList::encoded_len(ABANDONED_LIST_SLOTS);
        Ok(Self {
            next_free_page: read_addr(OFF_NEXT_FREE_PAGE),
            account_counter: u32::from_le_bytes(payload[OFF_ACCOUNT_COUNTER..OFF_ACCOUNT_COUNTER + 4].try_into().unwrap()),
            state_root: read_addr(OFF_STATE_ROOT),
            ids_root: read_addr(OFF_IDS_ROOT),
            storage_root: read_addr(OFF_STORAGE_ROOT),
            block_number: u32::from_le_bytes(payload[OFF_BLOCK_NUMBER..OFF_BLOCK_NUMBER + 4].try_into().unwrap()),
            state_hash: payload[OFF_STATE_HASH..OFF_STATE_HASH + 32].try_into().unwrap(),
            abandoned_list: AbandonedList::read_from(&payload[OFF_ABANDONED_LIST..abandoned_end], ABANDONED_LIST_SLOTS),
        })
    }

    pub fn to_page(&self, batch_id: u32) -> Page {
        let mut page = Page::zeroed();
        page.init(PageType::Root, batch_id);
        let payload = page.payload_mut();
        payload[OFF_NEXT_FREE_PAGE..OFF_NEXT_FREE_PAGE + 4].copy_from_slice(&self.next_free_page.raw().to_le_bytes());
        payload[OFF_ACCOUNT_COUNTER..OFF_ACCOUNT_COUNTER + 4].copy_from_slice(&self.account_counter.to_le_bytes());
        payload[OFF_STATE_ROOT..OFF_STATE_ROOT + 4].copy_from_slice(&self.state_root.raw().to_le_bytes());
        payload[OFF_IDS_ROOT..OFF_IDS_ROOT + 4].copy_from_slice(&self.ids_root.raw().to_le_bytes());
        payload[OFF_STORAGE_ROOT..OFF_STORAGE_ROOT + 4].copy_from_slice(&self.storage_root.raw().to_le_bytes());
        payload[OFF_BLOCK_NUMBER..OFF_BLOCK_NUMBER + 4].copy_from_slice(&self.block_number.to_le_bytes());
        payload[OFF_STATE_HASH..OFF_STATE_HASH + 32].copy_from_slice(&self.state_hash);
        let abandoned_end = OFF_ABANDONED_LIST + AbandonedList::encoded_len(ABANDONED_LIST_SLOTS);
        self.abandoned_list.write_to(&mut payload[OFF_ABANDONED_LIST..abandoned_end]);
        page
    }

    pub(crate) fn abandoned_list_mut(&mut self) -> &mut AbandonedList {
        &mut self.abandoned_list
    }

    pub(crate) fn bump_next_free_page(&mut self, capacity: u32) -> Result<DbAddress> {
        let addr = self.next_free_page;
        if addr.raw() >= capacity {
            return Err(Error::StorageExhausted);
        }
        self.next_free_page = addr.next();
        Ok(addr)
    }

    pub(crate) fn set_metadata(&mut self, block_number: u32, state_hash: [u8; 32]) {
        self.block_number = block_number;
        self.state_hash = state_hash;
    }

    pub fn block_number(&self) -> u32 {
        self.block_number
    }

    pub fn state_hash(&self) -> [u8; 32] {
        self.state_hash
    }

    pub fn state_root(&self) -> DbAddress {
        self.state_root
    }

    pub(crate) fn set_state_root(&mut self, addr: DbAddress) {
        self.state_root = addr;
    }

    pub(crate) fn ids_root(&self) -> DbAddress {
        self.ids_root
    }

    pub(crate) fn set_ids_root(&mut self, addr: DbAddress) {
        self.ids_root = addr;
    }

    pub(crate) fn storage_root(&self) -> DbAddress {
        self.storage_root
    }

    pub(crate) fn set_storage_root(&mut self, addr: DbAddress) {
        self.storage_root = addr;
    }

    /// Returns the next unused account id and reserves it.
    pub(crate) fn bump_account_counter(&mut self) -> u32 {
        let id = self.account_counter;
        self.account_counter += 1;
        id
    }
}

/// A root-level key: either a direct state-trie path, or an account's
/// per-contract storage key, resolved through the account id map (spec
/// §4.3.5).
pub enum Key<'a> {
    State(NibblePath<'a>),
    Storage {
        account: &'a [u8; 32],
        storage_path: NibblePath<'a>,
    },
}

/// `(account_id_be_bytes || storage_path)`, the key stored under a
/// [`storage_fanout`] bucket.
fn compose_storage_key<'s>(id: u32, storage_path: &NibblePath<'_>, scratch: &'s mut Vec<u8>) -> NibblePath<'s> {
    let id_bytes = id.to_be_bytes();
    NibblePath::from_bytes(&id_bytes).append(storage_path, scratch)
}

/// Looks up `account`'s id without allocating one, checking the batch's
/// cache before falling back to the id trie.
fn lookup_account_id(ctx: &BatchContext, account: &[u8; 32]) -> Result<Option<u32>> {
    if let Some(id) = ctx.id_for_account(account) {
        return Ok(Some(id));
    }
    let ids_root = ctx.root.ids_root();
    let account_key = NibblePath::from_bytes(account);
    match trie::get_in(ctx, ids_root, account_key)? {
        Some(bytes) => Ok(Some(u32::from_be_bytes(bytes.try_into().map_err(|_| {
            Error::InvariantViolated("id map entry is not 4 bytes")
        })?))),
        None => Ok(None),
    }
}

/// Resolves `account` to its 32-bit id, allocating and persisting a new one
/// (and bumping `account_counter`) on first use.
fn resolve_or_allocate_account_id(ctx: &mut BatchContext, account: &[u8; 32]) -> Result<u32> {
    if let Some(id) = lookup_account_id(ctx, account)? {
        ctx.cache_account_id(*account, id);
        return Ok(id);
    }
    let id = ctx.root.bump_account_counter();
    let account_key = NibblePath::from_bytes(account);
    let mut ids_root = ctx.root.ids_root();
    trie::set_in(ctx, &mut ids_root, account_key, &id.to_be_bytes())?;
    ctx.root.set_ids_root(ids_root);
    ctx.cache_account_id(*account, id);
    Ok(id)
}

pub fn root_try_get(ctx: &mut BatchContext, key: &Key<'_>) -> Result<Option<Vec<u8>>> {
    match key {
        Key::State(path) => trie::get_in(ctx, ctx.root.state_root(), *path),
        Key::Storage { account, storage_path } => {
            let Some(id) = lookup_account_id(ctx, account)? else {
                return Ok(None);
            };
            let mut scratch = Vec::new();
            let composed = compose_storage_key(id, storage_path, &mut scratch);
            storage_fanout::get(ctx, ctx.root.storage_root(), composed)
        }
    }
}

pub fn root_set(ctx: &mut BatchContext, key: &Key<'_>, value: &[u8]) -> Result<()> {
    match key {
        Key::State(path) => {
            let mut root = ctx.root.state_root();
            trie::set_in(ctx, &mut root, *path, value)?;
            ctx.root.set_state_root(root);
            Ok(())
        }
        Key::Storage { account, storage_path } => {
            let id = resolve_or_allocate_account_id(ctx, account)?;
            let mut scratch = Vec::new();
            let composed = compose_storage_key(id, storage_path, &mut scratch);
            let mut root = ctx.root.storage_root();
            storage_fanout::set(ctx, &mut root, composed, value)?;
            ctx.root.set_storage_root(root);
            Ok(())
        }
    }
}

/// Deletes an account's id-map entry, its state-trie entry, and its entire
/// storage subtree.
pub fn root_destroy(ctx: &mut BatchContext, account: &[u8; 32]) -> Result<()> {
    let account_key = NibblePath::from_bytes(account);

    let mut state_root = ctx.root.state_root();
    trie::set_in(ctx, &mut state_root, account_key, &[])?;
    ctx.root.set_state_root(state_root);

    if let Some(id) = lookup_account_id(ctx, account)? {
        let mut scratch = Vec::new();
        let id_prefix = compose_storage_key(id, &NibblePath::empty(), &mut scratch);
        let mut storage_root = ctx.root.storage_root();
        storage_fanout::delete_by_prefix(ctx, &mut storage_root, id_prefix)?;
        ctx.root.set_storage_root(storage_root);
    }

    let mut ids_root = ctx.root.ids_root();
    trie::set_in(ctx, &mut ids_root, account_key, &[])?;
    ctx.root.set_ids_root(ids_root);
    Ok(())
}

/// Deletes every state-trie key starting with `prefix`.
pub fn root_delete_by_prefix(ctx: &mut BatchContext, prefix: NibblePath<'_>) -> Result<()> {
    let mut state_root = ctx.root.state_root();
    trie::delete_by_prefix_in(ctx, &mut state_root, prefix)?;
    ctx.root.set_state_root(state_root);
    Ok(())
}
