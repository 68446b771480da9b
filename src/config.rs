//! Index-wide configuration, generalized from the read-only-btree
//! `Config` this codebase has always built (block sizes, a name, a
//! directory) to the knobs an inverted-index B-tree needs: page size,
//! micro-index fan-out, the inline/posting-tree threshold and the
//! fast-update toggle from spec.md §6.

use crate::error::{Error, Result};

/// Sentinel `n_posting` value marking "this entry tuple holds a pointer to
/// a posting tree" rather than an inline list. Fixed, not configurable.
pub const POSTING_TREE_SENTINEL: u16 = 0xFFFF;

/// Number of micro-index slots kept at the tail of every data page.
pub const DEFAULT_MICRO_INDEX_K: usize = 32;

/// Default page size, matching the host page size this design assumes
/// (spec.md §3, "typically 8 KiB").
pub const DEFAULT_BLKSZ: usize = 8 * 1024;

/// Fixed size of a page's opaque tail: right_link(4) + max_offset(2) +
/// free_space(2) + flags(2).
pub const OPAQUE_TAIL_SIZE: usize = 10;

/// Rough per-page header reserved for a data page's right-bound `HeapPtr`
/// (6 bytes: block u32 + offset u16) plus a small fixed preamble.
pub const DATA_PAGE_HEADER_SIZE: usize = 6;

#[derive(Clone, Debug)]
pub struct Config {
    /// Name of the index, used only for diagnostics and the tool binary.
    pub name: String,
    /// Directory holding the index's single data file and WAL.
    pub dir: String,
    /// Page size in bytes (spec.md BLKSZ).
    pub blk_sz: usize,
    /// Number of micro-index slots per data page (spec.md K).
    pub micro_index_k: usize,
    /// Enables the pending-list insertion buffer (spec.md §6). The core
    /// itself does not implement the buffer's flush policy; this flag is
    /// threaded through so `Index::insert` can decide whether to route
    /// through `list_page_append` or straight to `insert_bulk`.
    pub use_fast_update: bool,
    /// Flush queue depth for the WAL writer thread.
    pub wal_flush_queue_size: usize,
}

impl Config {
    const FLUSH_QUEUE_SIZE: usize = 16;

    pub fn new(dir: &str, name: &str) -> Config {
        Config {
            dir: dir.to_string(),
            name: name.to_string(),
            blk_sz: DEFAULT_BLKSZ,
            micro_index_k: DEFAULT_MICRO_INDEX_K,
            use_fast_update: true,
            wal_flush_queue_size: Self::FLUSH_QUEUE_SIZE,
        }
    }

    /// `GinMaxItemSize`-equivalent: the largest an entry tuple's packed
    /// inline-posting body may be before the build routine is forced to
    /// convert it into a posting-tree pointer. Derived the same way the
    /// original computes `GinMaxItemSize` from `BLCKSZ`: divide the usable
    /// page body by 6 (so at least 6 entries always fit on a leaf) minus
    /// one item-pointer slot's worth of bookkeeping.
    pub fn max_item_size(&self) -> usize {
        let usable = self.blk_sz
            - DATA_PAGE_HEADER_SIZE
            - OPAQUE_TAIL_SIZE
            - self.micro_index_k * crate::page::MICRO_INDEX_ENTRY_SIZE;
        usable / 6 - 4
    }

    /// Per-item envelope the Item Codec guarantees it will never exceed,
    /// used by callers to reserve headroom before encoding (spec.md §4.1).
    pub fn item_envelope(&self, max_aux_size: usize) -> usize {
        max_aux_size + 10
    }

    pub fn validate(&self) -> Result<()> {
        if self.blk_sz < 512 {
            return Err(Error::invariant("blk_sz too small to hold a page header"));
        }
        if self.micro_index_k == 0 {
            return Err(Error::invariant("micro_index_k must be > 0"));
        }
        Ok(())
    }
}
