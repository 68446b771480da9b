//! Build-time accumulator (spec.md §9 design note "Arena + indices"): a
//! flat arena of `(key, posting)` pairs collected during a bulk insert or
//! a pending-list flush, grouped and deduped once at `finish` time rather
//! than maintaining a sorted structure incrementally.
//!
//! Grounded on this codebase's version-arena style (`mvcc.rs`'s append-
//! then-reconcile approach to batching mutations before they are folded
//! into the tree), adapted here to the entry tree's `(key, Vec<posting>)`
//! shape.

use std::cmp::Ordering;

use crate::model::{compare_keys, Key, Posting};
use crate::opclass::OpClass;

/// Collects `(key, posting)` pairs in arrival order; `finish` sorts and
/// groups them into per-key posting batches ready for `entry_tree::insert`
/// (spec.md §4.4's contract that posting batches arrive pre-sorted and
/// deduped per key).
#[derive(Default)]
pub struct Accumulator {
    items: Vec<(Key, Posting)>,
}

impl Accumulator {
    pub fn new() -> Accumulator {
        Accumulator { items: Vec::new() }
    }

    pub fn push(&mut self, key: Key, posting: Posting) {
        self.items.push((key, posting));
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Consume the accumulator, producing `(key, postings)` groups sorted
    /// by key, each group's postings sorted and deduped by `HeapPtr`.
    pub fn finish(mut self, opclass: &dyn OpClass) -> Vec<(Key, Vec<Posting>)> {
        let cmp = |a: &Key, b: &Key| compare_keys(a, b, |attr, x, y| opclass.compare(attr, x, y));
        self.items.sort_by(|a, b| cmp(&a.0, &b.0).then_with(|| a.1.ptr.cmp(&b.1.ptr)));

        let mut out: Vec<(Key, Vec<Posting>)> = Vec::new();
        for (key, posting) in self.items {
            match out.last_mut() {
                Some((last_key, postings)) if cmp(last_key, &key) == Ordering::Equal => {
                    postings.push(posting);
                }
                _ => out.push((key, vec![posting])),
            }
        }
        for (_, postings) in out.iter_mut() {
            postings.dedup_by_key(|p| p.ptr);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Aux, Category, HeapPtr};
    use crate::opclass::{ExtractedEntry, MatchState, OpClassCapabilities, QueryEntry};
    use crate::error::Result;

    struct BytesOpClass;
    impl OpClass for BytesOpClass {
        fn extract_value(&self, _attr: u16, _value: &[u8]) -> Result<Vec<ExtractedEntry>> {
            Ok(Vec::new())
        }
        fn extract_query(&self, _attr: u16, _query: &[u8]) -> Result<Vec<QueryEntry>> {
            Ok(Vec::new())
        }
        fn compare(&self, _attr: u16, a: &[u8], b: &[u8]) -> std::cmp::Ordering {
            a.cmp(b)
        }
        fn consistent(&self, _attr: u16, _query_key: &[u8], _category: Category, _state: &MatchState) -> Result<bool> {
            Ok(true)
        }
        fn capabilities(&self, _attr: u16) -> OpClassCapabilities {
            OpClassCapabilities::default()
        }
    }

    fn key(k: u32) -> Key {
        Key::norm(1, Box::from(k.to_be_bytes()))
    }

    fn posting(offset: u16) -> Posting {
        Posting::new(HeapPtr::new(1, offset), Aux::none())
    }

    #[test]
    fn groups_and_dedups_by_key_in_sorted_order() {
        let mut acc = Accumulator::new();
        acc.push(key(5), posting(1));
        acc.push(key(1), posting(2));
        acc.push(key(5), posting(1)); // duplicate ptr
        acc.push(key(1), posting(1));

        let groups = acc.finish(&BytesOpClass);
        assert_eq!(groups.len(), 2);
        assert_eq!(&*groups[0].0.datum, &1u32.to_be_bytes());
        let g0_ptrs: Vec<HeapPtr> = groups[0].1.iter().map(|p| p.ptr).collect();
        assert_eq!(g0_ptrs, vec![HeapPtr::new(1, 1), HeapPtr::new(1, 2)]);

        assert_eq!(&*groups[1].0.datum, &5u32.to_be_bytes());
        let g1_ptrs: Vec<HeapPtr> = groups[1].1.iter().map(|p| p.ptr).collect();
        assert_eq!(g1_ptrs, vec![HeapPtr::new(1, 1)]);
    }

    #[test]
    fn empty_accumulator_finishes_empty() {
        let acc = Accumulator::new();
        assert!(acc.finish(&BytesOpClass).is_empty());
    }
}
