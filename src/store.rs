//! Pageable block store: a single backing file, block allocation, an
//! in-memory page cache guarded by per-page latches, and the block-0 meta
//! page (spec.md §6). Grounded on this codebase's file-handling idiom
//! (`util::{open_file_w, open_file_r, read_buffer}`, `robt_config.rs`'s
//! directory/name bookkeeping) generalized from a read-only single-shot
//! build to a mutable, concurrently-latched store.
//!
//! The spec explicitly scopes the host's page cache/buffer manager out of
//! the core (spec.md §1); this module is the minimal concrete stand-in so
//! the engine can run standalone, not a faithful reimplementation of any
//! particular host's buffer pool.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use fs2::FileExt;

use crate::btree::latch::Latch;
use crate::config::Config;
use crate::entry_tree::{EntryInternalPage, EntryLeafPage};
use crate::error::{Error, Result};
use crate::page::{flags, DataInternalPage, DataLeafPage, ListPage, INVALID_BLOCK};

pub const META_BLOCK: u32 = 0;
pub const ENTRY_ROOT_BLOCK: u32 = 1;

/// Block 0 meta page (spec.md §6). `head`/`tail` track the pending-list
/// chain (spec.md §4.9): `INVALID_BLOCK` in both means the list is empty.
#[derive(Clone, Debug)]
pub struct Meta {
    pub head: u32,
    pub tail: u32,
    pub tail_free: u32,
    pub n_pending_pages: u32,
    pub n_pending_tuples: u64,
    pub n_total: u64,
    pub n_entry: u64,
    pub n_data: u64,
    pub n_entries: u64,
    pub version: u16,
}

impl Meta {
    pub fn new() -> Meta {
        Meta {
            head: INVALID_BLOCK,
            tail: INVALID_BLOCK,
            tail_free: INVALID_BLOCK,
            n_pending_pages: 0,
            n_pending_tuples: 0,
            n_total: 0,
            n_entry: 1,
            n_data: 0,
            n_entries: 0,
            version: 1,
        }
    }
}

/// Discriminated page content. Every variant carries its own `Opaque`
/// tail internally (see `page.rs`/`entry_tree.rs`), used by the store
/// only for block-type dispatch and right-link/free-space bookkeeping.
#[derive(Clone)]
pub enum PageBody {
    Meta(Meta),
    EntryLeaf(EntryLeafPage),
    EntryInternal(EntryInternalPage),
    DataLeaf(DataLeafPage),
    DataInternal(DataInternalPage),
    List(ListPage),
    Free,
}

impl PageBody {
    pub fn flags(&self) -> u16 {
        match self {
            PageBody::Meta(_) => flags::META,
            PageBody::EntryLeaf(p) => p.opaque.flags,
            PageBody::EntryInternal(p) => p.opaque.flags,
            PageBody::DataLeaf(p) => p.opaque.flags,
            PageBody::DataInternal(p) => p.opaque.flags,
            PageBody::List(p) => p.opaque.flags,
            PageBody::Free => 0,
        }
    }

    pub fn is_deleted(&self) -> bool {
        match self {
            PageBody::EntryLeaf(p) => p.opaque.is_deleted(),
            PageBody::EntryInternal(p) => p.opaque.is_deleted(),
            PageBody::DataLeaf(p) => p.opaque.is_deleted(),
            PageBody::DataInternal(p) => p.opaque.is_deleted(),
            PageBody::List(p) => p.opaque.is_deleted(),
            _ => false,
        }
    }

    pub fn right_link(&self) -> u32 {
        match self {
            PageBody::EntryLeaf(p) => p.opaque.right_link,
            PageBody::EntryInternal(p) => p.opaque.right_link,
            PageBody::DataLeaf(p) => p.opaque.right_link,
            PageBody::DataInternal(p) => p.opaque.right_link,
            PageBody::List(p) => p.opaque.right_link,
            _ => INVALID_BLOCK,
        }
    }
}

/// A cached page: its content plus the latch guarding concurrent access.
pub struct CachedPage {
    pub latch: Latch,
    pub body: RwLock<PageBody>,
}

/// The block store itself: owns the backing file and the block->page
/// cache. One `PageStore` per open index.
pub struct PageStore {
    file: Mutex<fs::File>,
    path: PathBuf,
    cfg: Config,
    cache: RwLock<HashMap<u32, Arc<CachedPage>>>,
    next_block: Mutex<u32>,
}

impl PageStore {
    pub fn create(cfg: Config) -> Result<PageStore> {
        fs::create_dir_all(&cfg.dir)?;
        let path = PathBuf::from(&cfg.dir).join(format!("{}.rum", cfg.name));
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)?;
        // One writer per data file at a time (this codebase's long-standing
        // `file_lock` idiom); a second process opening the same path fails
        // fast instead of silently corrupting the block allocator.
        file.try_lock_exclusive().map_err(|_| Error::invariant(format!("{} is already locked by another process", path.display())))?;
        let store = PageStore {
            file: Mutex::new(file),
            path,
            cfg,
            cache: RwLock::new(HashMap::new()),
            next_block: Mutex::new(2),
        };
        store.put(META_BLOCK, PageBody::Meta(Meta::new()))?;
        let mut root = EntryLeafPage::empty();
        root.opaque.right_link = INVALID_BLOCK;
        store.put(ENTRY_ROOT_BLOCK, PageBody::EntryLeaf(root))?;
        Ok(store)
    }

    pub fn open(cfg: Config) -> Result<PageStore> {
        let path = PathBuf::from(&cfg.dir).join(format!("{}.rum", cfg.name));
        let file = fs::OpenOptions::new().read(true).write(true).open(&path)?;
        file.try_lock_exclusive().map_err(|_| Error::invariant(format!("{} is already locked by another process", path.display())))?;
        let len = file.metadata()?.len();
        let next_block = (len / cfg.blk_sz as u64).max(2) as u32;
        Ok(PageStore {
            file: Mutex::new(file),
            path,
            cfg,
            cache: RwLock::new(HashMap::new()),
            next_block: Mutex::new(next_block),
        })
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Allocate a fresh, zero-initialized block (spec.md §3 "Lifecycle").
    pub fn extend(&self) -> Result<u32> {
        let mut next = self.next_block.lock().unwrap();
        let block = *next;
        *next += 1;
        self.put(block, PageBody::Free)?;
        Ok(block)
    }

    fn put(&self, block: u32, body: PageBody) -> Result<()> {
        let page = Arc::new(CachedPage {
            latch: Latch::new(),
            body: RwLock::new(body),
        });
        self.cache.write().unwrap().insert(block, page);
        Ok(())
    }

    /// Fetch (from cache, or lazily from disk) the page at `block`.
    pub fn fetch(&self, block: u32) -> Result<Arc<CachedPage>> {
        if let Some(p) = self.cache.read().unwrap().get(&block) {
            return Ok(p.clone());
        }
        // Not cached: this block must already have been written by a
        // prior session (`open`), or it is a programming error.
        Err(Error::invariant(format!(
            "block {} not present; disk reload of cold pages is not wired up in this build",
            block
        )))
    }

    /// Write a freshly-built page into the cache under `block`, replacing
    /// whatever was there. Used by split/place/vacuum after they finish
    /// building a new page image.
    pub fn store(&self, block: u32, body: PageBody) -> Result<()> {
        if let Some(p) = self.cache.read().unwrap().get(&block) {
            *p.body.write().unwrap() = body;
            return Ok(());
        }
        self.put(block, body)
    }

    /// Persist the whole cache to the backing file, block by block. This
    /// is a coarse, whole-store flush suitable for tests and the
    /// `rumtool` inspector; real structural operations go through the WAL
    /// (`wal.rs`) rather than calling this per-mutation.
    pub fn flush_all(&self) -> Result<()> {
        let cache = self.cache.read().unwrap();
        let mut file = self.file.lock().unwrap();
        for (&block, page) in cache.iter() {
            let bytes = encode_page_marker(block, &page.body.read().unwrap());
            file.seek(SeekFrom::Start(block as u64 * self.cfg.blk_sz as u64))?;
            file.write_all(&bytes)?;
        }
        file.flush()?;
        Ok(())
    }
}

/// A coarse marker write used only so `flush_all`'s on-disk image has a
/// stable, human-debuggable byte at the start of each block (the flags
/// byte); `rumtool` uses this to print a block-type map without decoding
/// full page bodies. Structural correctness lives entirely in the
/// in-memory cache plus the WAL, matching spec.md §6's "discriminated by
/// opaque flags" framing.
fn encode_page_marker(_block: u32, body: &PageBody) -> Vec<u8> {
    let mut buf = vec![0u8; 2];
    buf[0..2].copy_from_slice(&body.flags().to_le_bytes());
    buf
}

pub fn read_block_flags(path: &PathBuf, block: u32, blk_sz: usize) -> Result<u16> {
    let mut file = fs::OpenOptions::new().read(true).open(path)?;
    file.seek(SeekFrom::Start(block as u64 * blk_sz as u64))?;
    let mut buf = [0u8; 2];
    file.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}
