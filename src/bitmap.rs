//! Pluggable posting bitmap (spec.md §4.7, §5): the in-memory set a
//! partial-match or full-scan entry materializes into while walking
//! contiguous entry-tree leaves, plus the "downgrade to lossy" behavior a
//! memory-budget-constrained scan needs.
//!
//! Grounded on this codebase's adapter-trait-per-backend style
//! (`bitmaps/mod.rs`'s `Bloom` adaptors for `CRoaring`/`NoBitmap`), but the
//! contract here is a `HeapPtr` *membership set*, not an approximate
//! membership filter: a lossy entry means "some row on this page", and
//! `contains` must say so precisely, not probabilistically.

use std::collections::BTreeSet;

use croaring::Bitmap;

use crate::model::HeapPtr;

/// A materialized set of `HeapPtr`s, with the option to fold an entire
/// page down to a single lossy marker once a memory budget is exceeded
/// (spec.md §4.7 "Cancellation & memory").
pub trait PostingBitmap: Send {
    fn insert(&mut self, ptr: HeapPtr);

    /// Fold every currently-held exact pointer on `block` into one lossy
    /// marker, and mark the page itself lossy so future `insert`s for that
    /// block are no-ops (spec.md §4.7's budget-triggered downgrade).
    fn downgrade_page(&mut self, block: u32);

    fn contains(&self, ptr: HeapPtr) -> bool;

    fn is_lossy_page(&self, block: u32) -> bool;

    /// Iterate every member in ascending `HeapPtr` order: lossy page
    /// markers interleave in block order, exact pointers in `(block,
    /// offset)` order, matching spec.md §4.7's "emit in HeapPtr order"
    /// per-entry advancement contract.
    fn iter_sorted(&self) -> Box<dyn Iterator<Item = HeapPtr> + '_>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Default backend: an exact `BTreeSet<HeapPtr>` plus a `croaring::Bitmap`
/// of lossy page numbers. Cheap for the common case (a few thousand
/// postings), and the roaring bitmap keeps the lossy-page set compact even
/// when a scan downgrades many pages under memory pressure.
#[derive(Default)]
pub struct RoaringPostingBitmap {
    exact: BTreeSet<HeapPtr>,
    lossy_pages: Bitmap,
}

impl RoaringPostingBitmap {
    pub fn new() -> RoaringPostingBitmap {
        RoaringPostingBitmap {
            exact: BTreeSet::new(),
            lossy_pages: Bitmap::create(),
        }
    }
}

impl PostingBitmap for RoaringPostingBitmap {
    fn insert(&mut self, ptr: HeapPtr) {
        if self.lossy_pages.contains(ptr.block) {
            return;
        }
        self.exact.insert(ptr);
    }

    fn downgrade_page(&mut self, block: u32) {
        self.exact.retain(|p| p.block != block);
        self.lossy_pages.add(block);
    }

    fn contains(&self, ptr: HeapPtr) -> bool {
        self.lossy_pages.contains(ptr.block) || self.exact.contains(&ptr)
    }

    fn is_lossy_page(&self, block: u32) -> bool {
        self.lossy_pages.contains(block)
    }

    fn len(&self) -> usize {
        self.exact.len() + self.lossy_pages.cardinality() as usize
    }

    fn iter_sorted(&self) -> Box<dyn Iterator<Item = HeapPtr> + '_> {
        let lossy = self.lossy_pages.iter().map(HeapPtr::lossy).peekable();
        let exact = self.exact.iter().copied().peekable();
        Box::new(merge_ascending(lossy, exact))
    }
}

/// Merge two already-ascending `HeapPtr` iterators into one ascending
/// stream (the lossy-page markers and exact pointers are each internally
/// sorted, but interleaved by block number).
fn merge_ascending<A, B>(mut a: std::iter::Peekable<A>, mut b: std::iter::Peekable<B>) -> impl Iterator<Item = HeapPtr>
where
    A: Iterator<Item = HeapPtr>,
    B: Iterator<Item = HeapPtr>,
{
    std::iter::from_fn(move || match (a.peek(), b.peek()) {
        (Some(x), Some(y)) => {
            if x <= y {
                a.next()
            } else {
                b.next()
            }
        }
        (Some(_), None) => a.next(),
        (None, Some(_)) => b.next(),
        (None, None) => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_membership_round_trips() {
        let mut bm = RoaringPostingBitmap::new();
        bm.insert(HeapPtr::new(3, 1));
        bm.insert(HeapPtr::new(3, 5));
        bm.insert(HeapPtr::new(7, 2));
        assert!(bm.contains(HeapPtr::new(3, 1)));
        assert!(!bm.contains(HeapPtr::new(3, 2)));
        assert_eq!(bm.iter_sorted().collect::<Vec<_>>(), vec![HeapPtr::new(3, 1), HeapPtr::new(3, 5), HeapPtr::new(7, 2)]);
    }

    #[test]
    fn downgrading_a_page_suppresses_future_exact_inserts() {
        let mut bm = RoaringPostingBitmap::new();
        bm.insert(HeapPtr::new(3, 1));
        bm.downgrade_page(3);
        bm.insert(HeapPtr::new(3, 9));
        assert!(bm.is_lossy_page(3));
        assert!(bm.contains(HeapPtr::new(3, 9)));
        assert_eq!(bm.iter_sorted().collect::<Vec<_>>(), vec![HeapPtr::lossy(3)]);
    }
}
