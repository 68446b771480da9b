//! Page opaque tail and the "data page" layout used by posting trees:
//! a right-bound `HeapPtr`, a compressed posting stream (Item Codec), and
//! a trailing micro-index for O(log K) intra-page seeks (spec.md §4.2).
//!
//! Entry-tree pages have a different content shape (`entry_tree.rs` owns
//! their encode/decode) but share this module's `Opaque` tail and block
//! discrimination flags (spec.md §6).

use crate::codec::{AttrDescriptor, ItemCodec};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{HeapPtr, Key, Posting};

pub const INVALID_BLOCK: u32 = 0xFFFF_FFFF;
const INVALID_OFFSET: u16 = 0xFFFF;

/// bits, matching spec.md §6's fixed 8-byte-plus-flags opaque tail.
pub mod flags {
    pub const DATA: u16 = 1 << 0;
    pub const LEAF: u16 = 1 << 1;
    pub const DELETED: u16 = 1 << 2;
    pub const META: u16 = 1 << 3;
    pub const LIST: u16 = 1 << 4;
    pub const LIST_FULLROW: u16 = 1 << 5;
}

/// Fixed-size page opaque tail (spec.md §6): `right_link`, `max_offset`,
/// `free_space`, `flags`. Relied upon for page-type discrimination.
#[derive(Clone, Copy, Debug)]
pub struct Opaque {
    pub right_link: u32,
    pub left_link: u32,
    pub max_offset: u16,
    pub free_space: u16,
    pub flags: u16,
}

impl Opaque {
    pub fn new(flag_bits: u16) -> Opaque {
        Opaque {
            right_link: INVALID_BLOCK,
            left_link: INVALID_BLOCK,
            max_offset: 0,
            free_space: 0,
            flags: flag_bits,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.flags & flags::LEAF != 0
    }

    pub fn is_deleted(&self) -> bool {
        self.flags & flags::DELETED != 0
    }

    pub fn has_right_link(&self) -> bool {
        self.right_link != INVALID_BLOCK
    }

    pub fn has_left_link(&self) -> bool {
        self.left_link != INVALID_BLOCK
    }
}

/// One entry in the tail-of-page micro-index. `page_offset` is the byte
/// offset, within the compressed body, of the item *after* the one this
/// slot indexes — so a resumed decode can use `heap_ptr` directly as
/// `prev` without re-decoding the indexed item's own bytes.
#[derive(Clone, Copy)]
pub struct MicroIndexEntry {
    pub offset_number: u16,
    pub page_offset: u32,
    pub heap_ptr: HeapPtr,
}

impl MicroIndexEntry {
    fn unused() -> MicroIndexEntry {
        MicroIndexEntry {
            offset_number: INVALID_OFFSET,
            page_offset: 0,
            heap_ptr: HeapPtr::MIN,
        }
    }

    fn is_used(&self) -> bool {
        self.offset_number != INVALID_OFFSET
    }
}

pub const MICRO_INDEX_ENTRY_SIZE: usize = 2 + 4 + 6;

/// Result of `DataLeafPage::search`: where to resume a linear decode scan
/// to reach `target`, plus how many items that scan is bounded to.
pub struct SeekHint {
    pub cursor: usize,
    pub prev: HeapPtr,
    pub scan_budget: usize,
}

/// A posting-tree leaf page: the compressed stream from the Item Codec,
/// framed by a right-bound and a micro-index (spec.md §4.2).
#[derive(Clone)]
pub struct DataLeafPage {
    pub right_bound: HeapPtr,
    pub body: Vec<u8>,
    pub micro_index: Vec<MicroIndexEntry>,
    pub opaque: Opaque,
}

impl DataLeafPage {
    pub fn empty(k: usize) -> DataLeafPage {
        DataLeafPage {
            right_bound: HeapPtr::MAX,
            body: Vec::new(),
            micro_index: vec![MicroIndexEntry::unused(); k],
            opaque: Opaque::new(flags::DATA | flags::LEAF),
        }
    }

    /// Rebuilds body + micro-index from a full in-memory item list
    /// (spec.md §4.2 contract: after any modification, the micro-index is
    /// rebuilt and `free_space`/`max_offset` reflect the new body).
    pub fn rebuild(&mut self, items: &[Posting], desc: &AttrDescriptor, cfg: &Config) -> Result<()> {
        let k = cfg.micro_index_k;
        let mut body = Vec::new();
        let mut starts = Vec::with_capacity(items.len());
        let mut prev = HeapPtr::MIN;
        for item in items {
            starts.push((body.len(), item.ptr));
            ItemCodec::encode(&mut body, prev, item, desc)?;
            prev = item.ptr;
        }
        let end = body.len();

        let maxoff = items.len();
        let mut micro_index = vec![MicroIndexEntry::unused(); k];
        if maxoff > 0 {
            for (slot, entry) in micro_index.iter_mut().enumerate() {
                let idx = (slot + 1) * maxoff / (k + 1);
                if idx >= maxoff {
                    break;
                }
                let next_start = starts.get(idx + 1).map(|(o, _)| *o).unwrap_or(end);
                *entry = MicroIndexEntry {
                    offset_number: (idx + 1) as u16,
                    page_offset: next_start as u32,
                    heap_ptr: starts[idx].1,
                };
            }
        }

        self.right_bound = items.last().map(|p| p.ptr).unwrap_or(self.right_bound);
        self.opaque.max_offset = maxoff as u16;
        let capacity = Self::capacity(cfg);
        self.opaque.free_space = capacity.saturating_sub(body.len()) as u16;
        self.body = body;
        self.micro_index = micro_index;
        Ok(())
    }

    pub fn capacity(cfg: &Config) -> usize {
        cfg.blk_sz
            - crate::config::DATA_PAGE_HEADER_SIZE
            - crate::config::OPAQUE_TAIL_SIZE
            - cfg.micro_index_k * MICRO_INDEX_ENTRY_SIZE
    }

    pub fn fits(&self, extra: usize, cfg: &Config) -> bool {
        self.body.len() + extra <= Self::capacity(cfg)
    }

    /// Decode the whole page into an item vector (used by vacuum and by
    /// the build-time merge step; scans prefer `search` + incremental
    /// decode so they can drop the latch early, per spec.md §4.5).
    pub fn decode_all(&self, desc: &AttrDescriptor) -> Result<Vec<Posting>> {
        let mut out = Vec::with_capacity(self.opaque.max_offset as usize);
        let mut cursor = 0;
        let mut prev = HeapPtr::MIN;
        while cursor < self.body.len() {
            let (item, n) = ItemCodec::decode(&self.body[cursor..], prev, desc, true, cursor)?;
            prev = item.ptr;
            cursor += n;
            out.push(item);
        }
        Ok(out)
    }

    /// Binary-search the micro-index for the first slot whose stored
    /// `HeapPtr >= target`, returning where a bounded linear decode scan
    /// should resume from (spec.md §4.2, §4.5 `scan_page`).
    pub fn search(&self, target: HeapPtr) -> SeekHint {
        let used: Vec<&MicroIndexEntry> = self.micro_index.iter().filter(|e| e.is_used()).collect();
        let mut end_slot = None;
        for (i, e) in used.iter().enumerate() {
            if e.heap_ptr >= target {
                end_slot = Some(i);
                break;
            }
        }
        let (cursor, prev) = if used.is_empty() {
            (0, HeapPtr::MIN)
        } else {
            match end_slot {
                Some(0) => (0, HeapPtr::MIN),
                Some(i) => (used[i - 1].page_offset as usize, used[i - 1].heap_ptr),
                None => {
                    let last = used.last().unwrap();
                    (last.page_offset as usize, last.heap_ptr)
                }
            }
        };
        let k = self.micro_index.len().max(1);
        let maxoff = self.opaque.max_offset as usize;
        let scan_budget = (maxoff / (k + 1)) + 1;
        SeekHint {
            cursor,
            prev,
            scan_budget,
        }
    }
}

/// A posting-tree internal page: `(child_block, separator_HeapPtr)`
/// pairs, ordered by separator (spec.md §3, §4.2).
#[derive(Clone)]
pub struct DataInternalPage {
    pub right_bound: HeapPtr,
    pub children: Vec<crate::model::PostingChildPtr>,
    pub opaque: Opaque,
}

impl DataInternalPage {
    pub fn empty() -> DataInternalPage {
        DataInternalPage {
            right_bound: HeapPtr::MAX,
            children: Vec::new(),
            opaque: Opaque::new(flags::DATA),
        }
    }

    pub fn find_child(&self, target: HeapPtr) -> Result<u32> {
        self.children
            .iter()
            .find(|c| c.separator >= target)
            .or_else(|| self.children.last())
            .map(|c| c.child_block)
            .ok_or_else(|| Error::invariant("internal data page has no children"))
    }

    pub fn recompute(&mut self) {
        self.opaque.max_offset = self.children.len() as u16;
        self.right_bound = self.children.last().map(|c| c.separator).unwrap_or(HeapPtr::MAX);
    }
}

/// Pending-list page (spec.md §4.9): a flat, unsorted run of raw `(key,
/// posting)` tuples appended as they arrive while `use_fast_update` is on,
/// not yet merged into the entry tree. `LIST_FULLROW` marks a page that
/// was filled in one single bulk append rather than incrementally, which
/// is all the distinction spec.md's GIN_LIST_FULLROW flag draws.
#[derive(Clone)]
pub struct ListPage {
    pub tuples: Vec<(Key, Posting)>,
    pub opaque: Opaque,
}

impl ListPage {
    pub fn empty() -> ListPage {
        ListPage {
            tuples: Vec::new(),
            opaque: Opaque::new(flags::LIST),
        }
    }

    pub fn encoded_size(&self, desc: &AttrDescriptor) -> usize {
        self.tuples
            .iter()
            .map(|(k, p)| 2 + 1 + k.datum.len() + ItemCodec::size(0, HeapPtr::MIN, p, desc))
            .sum()
    }
}
