//! The only "plugin" surface of the core (spec.md §6). An opclass is a
//! set of pure callbacks plus capability bits; the core never inspects a
//! key or aux payload beyond calling these. Mirrors the trait-based
//! `Diff`/`Serialize` seam this codebase has always used for pluggable
//! value semantics (`core.rs`), generalized to the larger callback table
//! GIN/RUM opclasses expose.

use std::cmp::Ordering;

use crate::error::Result;
use crate::model::{Aux, Category, HeapPtr, Key};

/// One `(key, aux)` tuple produced by `extract_value`/`extract_query` for
/// a single column value.
pub struct ExtractedEntry {
    pub key: Key,
    pub aux: Aux,
}

/// Per-key match state passed into `consistent`/`pre_consistent`: for each
/// scan entry belonging to this key, whether it currently matches the
/// candidate heap pointer, plus that entry's aux value if it does.
pub struct MatchState<'a> {
    pub matches: &'a [bool],
    pub aux: &'a [Aux],
    /// `true` if the candidate is a lossy (whole-page) pointer, forcing
    /// `recheck` regardless of what `consistent` returns.
    pub lossy: bool,
}

/// The operator-class callback table. `attr` identifies which index
/// column a call concerns; implementations are expected to dispatch on it
/// internally (the core is single-opclass-per-attr but does not enforce
/// that — it just always passes `attr` through).
pub trait OpClass: Send + Sync {
    /// Decompose a column value into zero or more `(key, aux)` tuples to
    /// be indexed for the row at `heap_ptr`.
    fn extract_value(&self, attr: u16, value: &[u8]) -> Result<Vec<ExtractedEntry>>;

    /// Decompose a query value into the `ScanKey`'s search entries. Each
    /// returned key becomes one `ScanEntry`'s seek target; `partial_match`
    /// marks entries that must be resolved by prefix scan rather than an
    /// exact posting-tree lookup.
    fn extract_query(&self, attr: u16, query: &[u8]) -> Result<Vec<QueryEntry>>;

    /// Three-way compare of two `Norm` key datums for `attr`. Never called
    /// for placeholder categories (spec.md §3).
    fn compare(&self, attr: u16, a: &[u8], b: &[u8]) -> Ordering;

    /// Partial-match ordering used by prefix/partial scan entries: `< 0`
    /// while `key` is still within the queried prefix, `> 0` once the
    /// entry tree has walked past it (used to stop a prefix scan).
    /// `None` if this opclass does not support partial matching.
    fn compare_partial(&self, _attr: u16, _query_partial: &[u8], _key: &[u8]) -> Option<Ordering> {
        None
    }

    /// Decide whether a candidate heap row satisfies the query given
    /// which entries of this key currently match.
    fn consistent(&self, attr: u16, query_key: &[u8], category: Category, state: &MatchState) -> Result<bool>;

    /// Monotone under-approximation of `consistent` used by fast scan to
    /// prune (spec.md §4.7). Must be true whenever `consistent` would be
    /// true; may also be true when `consistent` would be false (fast scan
    /// treats that as "cannot yet prune this prefix").
    fn pre_consistent(&self, _attr: u16, _query_key: &[u8], _category: Category, _state: &MatchState) -> Result<bool> {
        Ok(true)
    }

    /// Rank contribution for one order-by clause given the matching
    /// entries' aux data at the current heap pointer. Only called when
    /// the scan has ORDER-BY clauses and `can_ordering` is set.
    fn ordering(&self, _attr: u16, _aux: &[Aux]) -> f64 {
        0.0
    }

    fn capabilities(&self, attr: u16) -> OpClassCapabilities;
}

#[derive(Clone, Copy, Default)]
pub struct OpClassCapabilities {
    pub can_partial_match: bool,
    pub can_pre_consistent: bool,
    pub can_ordering: bool,
    pub can_outer_ordering: bool,
    /// Opclass wants the "add-to-column" posting ordering: posting-tree
    /// leaves compare by `(aux, HeapPtr)` instead of `HeapPtr` alone, so a
    /// full scan can stream postings in aux order (spec.md §3, §4.7).
    pub scan_with_add_info: bool,
}

/// One compiled `ScanKey` search term, the result of `extract_query`.
pub struct QueryEntry {
    pub key: Key,
    pub is_partial: bool,
    /// Predicted selectivity, used by fast scan to choose which lagging
    /// entry to seek forward (spec.md §4.7, "smallest predicted_count").
    pub predicted_count: Option<u64>,
}

/// Dead-row predicate handed to vacuum (spec.md §4.6). Returns `true` if
/// the row at `ptr` should be removed from every posting it appears in.
pub trait IsDead: Send + Sync {
    fn is_dead(&self, ptr: HeapPtr) -> bool;
}

impl<F> IsDead for F
where
    F: Fn(HeapPtr) -> bool + Send + Sync,
{
    fn is_dead(&self, ptr: HeapPtr) -> bool {
        (self)(ptr)
    }
}
