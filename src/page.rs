//! Raw pages and the header every page begins with (spec §3, §4.1).
//!
//! A [`Page`] is a fixed 4096-byte buffer. The first 8 bytes are a
//! [`PageHeader`]; the remaining 4088 bytes are the payload a typed view
//! (`DataPage`, `BottomPage`, ...) interprets. Header field offsets follow
//! the byte-offset-constant style of `nervusdb-v2-storage/src/index/btree.rs`
//! rather than a `#[repr(C)]` struct, so the layout is explicit and portable
//! across the buffer's lifetime (a page is sometimes a COW copy, sometimes a
//! view straight into the file's memory map).

use crate::address::DbAddress;
use crate::error::{Error, Result};

pub const PAGE_SIZE: usize = 4096;

const OFF_BATCH_ID: usize = 0;
const OFF_PAGE_TYPE: usize = 4;
const OFF_LEVEL: usize = 5;
const OFF_METADATA: usize = 6;
const OFF_VERSION: usize = 7;
pub const PAGE_HEADER_SIZE: usize = 8;
pub const PAGE_PAYLOAD_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

pub const PAPRIKA_VERSION: u8 = 1;

/// Discriminates what a page's payload means (the `page_type` header byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    Root = 0,
    Data = 1,
    Bottom = 2,
    LeafOverflow = 3,
    StorageFanOut = 4,
    Abandoned = 5,
}

impl PageType {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => PageType::Root,
            1 => PageType::Data,
            2 => PageType::Bottom,
            3 => PageType::LeafOverflow,
            4 => PageType::StorageFanOut,
            5 => PageType::Abandoned,
            other => return Err(Error::InvariantViolated(invalid_page_type_msg(other))),
        })
    }
}

fn invalid_page_type_msg(_v: u8) -> &'static str {
    "unrecognized page_type byte"
}

/// A fixed-size, owned page buffer. Header accessors read/write the first
/// [`PAGE_HEADER_SIZE`] bytes; `payload`/`payload_mut` expose the rest.
#[derive(Clone)]
pub struct Page {
    buf: Box<[u8; PAGE_SIZE]>,
}

impl Page {
    pub fn zeroed() -> Self {
        Self {
            buf: Box::new([0u8; PAGE_SIZE]),
        }
    }

    pub fn from_bytes(buf: Box<[u8; PAGE_SIZE]>) -> Self {
        Self { buf }
    }

    pub fn as_bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.buf
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.buf
    }

    #[inline]
    pub fn batch_id(&self) -> u32 {
        u32::from_le_bytes(self.buf[OFF_BATCH_ID..OFF_BATCH_ID + 4].try_into().unwrap())
    }

    #[inline]
    pub fn set_batch_id(&mut self, id: u32) {
        self.buf[OFF_BATCH_ID..OFF_BATCH_ID + 4].copy_from_slice(&id.to_le_bytes());
    }

    #[inline]
    pub fn page_type_raw(&self) -> u8 {
        self.buf[OFF_PAGE_TYPE]
    }

    pub fn page_type(&self) -> Result<PageType> {
        PageType::from_u8(self.page_type_raw())
    }

    #[inline]
    pub fn set_page_type(&mut self, ty: PageType) {
        self.buf[OFF_PAGE_TYPE] = ty as u8;
    }

    #[inline]
    pub fn level(&self) -> u8 {
        self.buf[OFF_LEVEL]
    }

    #[inline]
    pub fn set_level(&mut self, level: u8) {
        self.buf[OFF_LEVEL] = level;
    }

    #[inline]
    pub fn metadata(&self) -> u8 {
        self.buf[OFF_METADATA]
    }

    #[inline]
    pub fn set_metadata(&mut self, metadata: u8) {
        self.buf[OFF_METADATA] = metadata;
    }

    #[inline]
    pub fn version(&self) -> u8 {
        self.buf[OFF_VERSION]
    }

    #[inline]
    pub fn set_version(&mut self, version: u8) {
        self.buf[OFF_VERSION] = version;
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.buf[PAGE_HEADER_SIZE..]
    }

    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buf[PAGE_HEADER_SIZE..]
    }

    /// Initializes a freshly allocated page for `ty` at the given batch,
    /// zeroing the payload. Used by [`crate::batch::BatchContext::get_new_page`]
    /// when the manager hands back a page that may hold arbitrary bytes.
    pub fn init(&mut self, ty: PageType, batch_id: u32) {
        self.buf[PAGE_HEADER_SIZE..].fill(0);
        self.set_batch_id(batch_id);
        self.set_page_type(ty);
        self.set_level(0);
        self.set_metadata(0);
        self.set_version(PAPRIKA_VERSION);
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("batch_id", &self.batch_id())
            .field("page_type", &self.page_type_raw())
            .field("level", &self.level())
            .field("metadata", &self.metadata())
            .finish()
    }
}

/// Durability level requested for a write (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOptions {
    /// Persist data pages, then the root, then fsync.
    FlushDataAndRoot,
    /// Persist data pages and the root, skip fsync of the root.
    FlushDataOnly,
    /// Persist bytes, skip fsync entirely.
    DangerNoFlush,
    /// In-memory only; used by tests and benchmarks.
    DangerNoWrite,
}

/// External collaborator the core consumes for durable page storage
/// (spec §4.1, out of scope for this crate's own implementation save for
/// the file-backed reference implementation in [`crate::file_manager`]).
///
/// The spec describes these operations as returning futures; this crate
/// targets a synchronous `PageManager` (mirroring `nervusdb-v2-storage`'s
/// synchronous `Pager`) and leaves async wrapping to the embedder.
pub trait PageManager {
    fn get_at(&self, addr: DbAddress) -> Result<Page>;

    /// Returns a page bound to `addr` for writing. If `reused` is false the
    /// payload may contain arbitrary bytes from a previous occupant; callers
    /// must overwrite or `init` it before relying on its contents.
    fn get_for_writing(&self, addr: DbAddress, reused: bool) -> Result<Page>;

    fn get_address(&self, page: &Page) -> Result<DbAddress>;

    fn write_pages(&self, pages: &[(DbAddress, Page)], options: CommitOptions) -> Result<()>;

    fn write_root(&self, addr: DbAddress, root: &Page, options: CommitOptions) -> Result<()>;

    fn flush(&self) -> Result<()>;

    /// Hint only; implementations may ignore it.
    fn prefetch(&self, _addr: DbAddress) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let mut page = Page::zeroed();
        page.init(PageType::Data, 7);
        page.set_level(2);
        page.set_metadata(0x01);
        assert_eq!(page.batch_id(), 7);
        assert_eq!(page.page_type().unwrap(), PageType::Data);
        assert_eq!(page.level(), 2);
        assert_eq!(page.metadata(), 0x01);
        assert_eq!(page.version(), PAPRIKA_VERSION);
    }

    #[test]
    fn payload_is_full_remaining_buffer() {
        let page = Page::zeroed();
        assert_eq!(page.payload().len(), PAGE_PAYLOAD_SIZE);
    }

    #[test]
    fn unknown_page_type_is_an_error() {
        let mut page = Page::zeroed();
        page.as_bytes_mut()[OFF_PAGE_TYPE] = 0xEE;
        assert!(page.page_type().is_err());
    }
}
