//! Scan driver (spec.md §4.7): compiles a query into `ScanKey`/`ScanEntry`
//! streams — a live cursor per key's posting tree/inline list, or a
//! pre-materialized bitmap for partial/full-scan entries — and drives
//! them with one of the strategies chosen once at scan start (`Scan` for
//! the regular AND walk, `scan::fast::FastScan` for pre-consistent
//! skipping, `scan::FullScan` for the aux-ranked full walk).

pub mod fast;
pub mod merge;

use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;

use crate::bitmap::{PostingBitmap, RoaringPostingBitmap};
use crate::btree::{self, Dispatch};
use crate::codec::AttrDescriptor;
use crate::config::Config;
use crate::entry_tree::EntryDispatch;
use crate::error::{Error, Result};
use crate::model::{Aux, HeapPtr, Key, Posting, PostingRef};
use crate::opclass::{MatchState, OpClass};
use crate::page::INVALID_BLOCK;
use crate::posting_tree::PostingTree;
use crate::store::{PageBody, PageStore};

/// One compiled `(attr, query_value)` clause: the query key `consistent`
/// is evaluated against, plus the streams feeding it (spec.md §4.7,
/// usually one `ScanEntry` per key; more when `extract_query` associates
/// several entries with one clause).
pub(crate) struct ScanKey {
    pub(crate) attr: u16,
    pub(crate) query_key: Key,
    pub(crate) predicted_count: Option<u64>,
    pub(crate) entries: Vec<ScanEntry>,
}

impl ScanKey {
    fn current_min(&self) -> Option<HeapPtr> {
        self.entries.iter().filter_map(|e| e.current_ptr()).min()
    }

    fn advance_all_past(&mut self, target: HeapPtr) -> Result<()> {
        for e in &mut self.entries {
            e.advance_past(target)?;
        }
        Ok(())
    }

    fn match_state(&self, candidate: HeapPtr) -> (Vec<bool>, Vec<Aux>, bool) {
        let matches: Vec<bool> = self.entries.iter().map(|e| e.current_ptr() == Some(candidate)).collect();
        let aux: Vec<Aux> = self.entries.iter().map(|e| e.current_aux()).collect();
        (matches, aux, candidate.is_lossy())
    }

    /// Evaluate `consistent` at `candidate` (spec.md §4.7 "key_get_item").
    /// Returns `(consistent, lossy)`; a lossy candidate is passed through
    /// to the opclass rather than special-cased here, since only the
    /// opclass knows how to resolve the "try both present and absent"
    /// recheck spec.md describes.
    fn consistent_at(&self, candidate: HeapPtr, opclass: &dyn OpClass) -> Result<(bool, bool)> {
        let (matches, aux, lossy) = self.match_state(candidate);
        let state = MatchState {
            matches: &matches,
            aux: &aux,
            lossy,
        };
        let ok = opclass.consistent(self.attr, &self.query_key.datum, self.query_key.category, &state)?;
        Ok((ok, lossy))
    }

    fn pre_consistent_at(&self, candidate: HeapPtr, opclass: &dyn OpClass) -> Result<bool> {
        let (matches, aux, lossy) = self.match_state(candidate);
        let state = MatchState {
            matches: &matches,
            aux: &aux,
            lossy,
        };
        opclass.pre_consistent(self.attr, &self.query_key.datum, self.query_key.category, &state)
    }
}

/// One compiled stream backing a `ScanKey`.
pub(crate) struct ScanEntry {
    cursor: EntryCursor,
}

enum EntryCursor {
    Live(PostingCursor),
    Materialized(MaterializedCursor),
}

impl ScanEntry {
    fn current_ptr(&self) -> Option<HeapPtr> {
        match &self.cursor {
            EntryCursor::Live(c) => c.current().map(|p| p.ptr),
            EntryCursor::Materialized(c) => c.current(),
        }
    }

    fn current_aux(&self) -> Aux {
        match &self.cursor {
            EntryCursor::Live(c) => c.current().map(|p| p.aux.clone()).unwrap_or_else(Aux::none),
            EntryCursor::Materialized(_) => Aux::none(),
        }
    }

    fn advance_past(&mut self, target: HeapPtr) -> Result<()> {
        match &mut self.cursor {
            EntryCursor::Live(c) => c.advance_past(target),
            EntryCursor::Materialized(c) => {
                c.advance_past(target);
                Ok(())
            }
        }
    }
}

/// A pre-materialized, already-sorted `HeapPtr` set: the result of a
/// partial/prefix scan, or of a full-scan entry (spec.md §4.7).
struct MaterializedCursor {
    items: Vec<HeapPtr>,
    idx: usize,
}

impl MaterializedCursor {
    fn current(&self) -> Option<HeapPtr> {
        self.items.get(self.idx).copied()
    }

    fn advance_past(&mut self, target: HeapPtr) {
        while let Some(cur) = self.items.get(self.idx) {
            if *cur >= target {
                break;
            }
            self.idx += 1;
        }
    }
}

/// A live cursor into one key's posting stream: its inline list, or a
/// walk across a posting tree (spec.md §4.5 "Scan per leaf page"), one
/// leaf decoded into memory at a time.
///
/// A tree-backed cursor seeks by re-descending the posting tree straight
/// to the leaf covering the target (`PostingTree::locate`) rather than
/// stepping leaf-by-leaf via `right_link` — this is what gives fast scan
/// its `O(log)`-leaf-fetch skip over a long non-matching run (spec.md
/// §4.7 "Fast scan", scenario 5) instead of an `O(n)` walk. An inline-list
/// cursor has no tree to re-descend; its whole list is already resident,
/// so advancing is just a linear scan of that in-memory `Vec`.
///
/// Unlike the full protocol, this cursor does not implement
/// `re_find_leaf_page` recovery from a concurrent split observed
/// mid-scan (spec.md §5) — it always re-fetches by block number, so a
/// page that has since been deleted out from under it surfaces as an
/// error rather than transparently re-descending. Acceptable for this
/// core: the host is expected to hold at least a SHARE pin for the
/// duration of one scan.
struct PostingCursor {
    store: Arc<PageStore>,
    desc: AttrDescriptor,
    items: Vec<Posting>,
    idx: usize,
    /// `Some((cfg, root))` for a cursor backed by a posting tree, so
    /// `advance_past` can re-descend straight to the target leaf; `None`
    /// for an inline posting list, which has no tree to seek into.
    seek_root: Option<(Config, u32)>,
}

impl PostingCursor {
    fn inline(store: Arc<PageStore>, desc: AttrDescriptor, items: Vec<Posting>) -> PostingCursor {
        PostingCursor {
            store,
            desc,
            items,
            idx: 0,
            seek_root: None,
        }
    }

    fn tree(store: Arc<PageStore>, cfg: Config, desc: AttrDescriptor, root: u32) -> Result<PostingCursor> {
        let tree = PostingTree::at(store.clone(), cfg.clone(), root);
        let (leaf, _) = tree.locate(HeapPtr::MIN, &desc)?;
        let (items, _) = Self::load_leaf(&store, leaf, &desc)?;
        Ok(PostingCursor {
            store,
            desc,
            items,
            idx: 0,
            seek_root: Some((cfg, root)),
        })
    }

    fn load_leaf(store: &Arc<PageStore>, block: u32, desc: &AttrDescriptor) -> Result<(Vec<Posting>, u32)> {
        let page = store.fetch(block)?;
        let body = page.body.read().unwrap();
        match &*body {
            PageBody::DataLeaf(p) => Ok((p.decode_all(desc)?, p.opaque.right_link)),
            _ => Err(Error::invariant("expected posting leaf while scanning")),
        }
    }

    fn current(&self) -> Option<&Posting> {
        self.items.get(self.idx)
    }

    /// Advance past `target`. Within the currently loaded leaf this is a
    /// linear scan; once exhausted, a tree-backed cursor re-descends the
    /// posting tree straight to the leaf covering `target`
    /// (`PostingTree::locate`, an `O(log)`-page-fetch seek) rather than
    /// stepping right one leaf at a time, which is what lets fast scan
    /// skip a long non-matching run in `O(log)` leaf fetches instead of
    /// `O(n)` (spec.md §4.7 "Fast scan", scenario 5).
    fn advance_past(&mut self, target: HeapPtr) -> Result<()> {
        while let Some(p) = self.items.get(self.idx) {
            if p.ptr >= target {
                return Ok(());
            }
            self.idx += 1;
        }
        if let Some((cfg, root)) = &self.seek_root {
            let tree = PostingTree::at(self.store.clone(), cfg.clone(), *root);
            let (leaf, _) = tree.locate(target, &self.desc)?;
            let (items, _) = Self::load_leaf(&self.store, leaf, &self.desc)?;
            self.items = items;
            self.idx = 0;
            while let Some(p) = self.items.get(self.idx) {
                if p.ptr >= target {
                    break;
                }
                self.idx += 1;
            }
        }
        Ok(())
    }
}

/// Compile one `(attr, query)` clause into its `ScanKey`s (spec.md §4.7).
pub(crate) fn compile(store: &Arc<PageStore>, opclass: &Arc<dyn OpClass>, cfg: &Config, attr: u16, query: &[u8]) -> Result<Vec<ScanKey>> {
    let desc = AttrDescriptor::varlena();
    let mut keys = Vec::new();
    for qe in opclass.extract_query(attr, query)? {
        let entry = if qe.is_partial {
            build_partial_entry(store, opclass, cfg, &desc, &qe.key)?
        } else {
            build_simple_entry(store, opclass, cfg, &desc, &qe.key)?
        };
        keys.push(ScanKey {
            attr,
            query_key: qe.key,
            predicted_count: qe.predicted_count,
            entries: vec![entry],
        });
    }
    Ok(keys)
}

fn build_simple_entry(store: &Arc<PageStore>, opclass: &Arc<dyn OpClass>, cfg: &Config, desc: &AttrDescriptor, key: &Key) -> Result<ScanEntry> {
    let dispatch = EntryDispatch {
        store: store.clone(),
        opclass: opclass.clone(),
        cfg: cfg.clone(),
    };
    let (leaf, _) = btree::find_leaf(&dispatch, key)?;
    let cursor = match dispatch.find_in_leaf(leaf, key)? {
        Some(tuple) => match tuple.posting {
            PostingRef::Inline(items) => EntryCursor::Live(PostingCursor::inline(store.clone(), *desc, items)),
            PostingRef::Tree(root) => EntryCursor::Live(PostingCursor::tree(store.clone(), cfg.clone(), *desc, root)?),
        },
        None => EntryCursor::Materialized(MaterializedCursor { items: Vec::new(), idx: 0 }),
    };
    Ok(ScanEntry { cursor })
}

/// Materialize a partial/prefix entry by walking contiguous entry-tree
/// leaves from the first tuple matching the prefix until `compare_partial`
/// reports we have walked past it (spec.md §4.7 "Partial/prefix entry").
fn build_partial_entry(store: &Arc<PageStore>, opclass: &Arc<dyn OpClass>, cfg: &Config, desc: &AttrDescriptor, key: &Key) -> Result<ScanEntry> {
    let dispatch = EntryDispatch {
        store: store.clone(),
        opclass: opclass.clone(),
        cfg: cfg.clone(),
    };
    let (mut block, _) = btree::find_leaf(&dispatch, key)?;
    let mut bm = RoaringPostingBitmap::new();
    'outer: loop {
        let page = store.fetch(block)?;
        let body = page.body.read().unwrap();
        let leaf = match &*body {
            PageBody::EntryLeaf(p) => p,
            _ => return Err(Error::invariant("expected entry leaf during partial scan")),
        };
        for tuple in &leaf.tuples {
            match opclass.compare_partial(key.attr, &key.datum, &tuple.key.datum) {
                Some(ord) if ord != CmpOrdering::Greater => {
                    collect_postings_into(store, desc, &tuple.posting, &mut bm)?;
                }
                Some(_) => break 'outer,
                None => return Err(Error::invariant("opclass does not support partial match")),
            }
        }
        let next = leaf.opaque.right_link;
        drop(body);
        if next == INVALID_BLOCK {
            break;
        }
        block = next;
    }
    let items: Vec<HeapPtr> = bm.iter_sorted().collect();
    Ok(ScanEntry {
        cursor: EntryCursor::Materialized(MaterializedCursor { items, idx: 0 }),
    })
}

fn collect_postings_into(store: &Arc<PageStore>, desc: &AttrDescriptor, posting: &PostingRef, bm: &mut RoaringPostingBitmap) -> Result<()> {
    match posting {
        PostingRef::Inline(items) => {
            for it in items {
                bm.insert(it.ptr);
            }
            Ok(())
        }
        PostingRef::Tree(root) => {
            let mut block = *root;
            loop {
                let page = store.fetch(block)?;
                let body = page.body.read().unwrap();
                match &*body {
                    PageBody::DataLeaf(p) => {
                        for it in p.decode_all(desc)? {
                            bm.insert(it.ptr);
                        }
                        let next = p.opaque.right_link;
                        drop(body);
                        if next == INVALID_BLOCK {
                            return Ok(());
                        }
                        block = next;
                    }
                    PageBody::DataInternal(p) => {
                        let next = p.children.first().ok_or_else(|| Error::invariant("posting internal node has no children"))?.child_block;
                        drop(body);
                        block = next;
                    }
                    _ => return Err(Error::invariant("expected posting page")),
                }
            }
        }
    }
}

fn collect_all_postings(store: &Arc<PageStore>, desc: &AttrDescriptor, root: u32) -> Result<Vec<Posting>> {
    let mut out = Vec::new();
    let mut block = root;
    loop {
        let page = store.fetch(block)?;
        let body = page.body.read().unwrap();
        match &*body {
            PageBody::DataLeaf(p) => {
                out.extend(p.decode_all(desc)?);
                let next = p.opaque.right_link;
                drop(body);
                if next == INVALID_BLOCK {
                    return Ok(out);
                }
                block = next;
            }
            PageBody::DataInternal(p) => {
                let next = p.children.first().ok_or_else(|| Error::invariant("posting internal node has no children"))?.child_block;
                drop(body);
                block = next;
            }
            _ => return Err(Error::invariant("expected posting page")),
        }
    }
}

/// Regular (conjunctive/AND) scan (spec.md §4.7 "Regular scan"): a
/// merge-join across every compiled key's current item, advancing the
/// laggards until all keys agree on a candidate, then evaluating
/// `consistent`.
pub struct Scan {
    keys: Vec<ScanKey>,
    opclass: Arc<dyn OpClass>,
    exhausted: bool,
}

impl Scan {
    pub fn new(store: &Arc<PageStore>, opclass: &Arc<dyn OpClass>, cfg: &Config, attr: u16, query: &[u8]) -> Result<Scan> {
        let keys = compile(store, opclass, cfg, attr, query)?;
        let exhausted = keys.is_empty();
        Ok(Scan {
            keys,
            opclass: opclass.clone(),
            exhausted,
        })
    }

    /// Produce the next matching heap pointer, paired with whether it was
    /// a lossy (whole-page) candidate the caller must recheck against the
    /// actual row (spec.md §4.7 "Lossy-page pointers force recheck").
    pub fn advance(&mut self) -> Result<Option<(HeapPtr, bool)>> {
        if self.exhausted {
            return Ok(None);
        }
        loop {
            let mut candidate: Option<HeapPtr> = None;
            for key in &self.keys {
                match key.current_min() {
                    None => {
                        self.exhausted = true;
                        return Ok(None);
                    }
                    Some(it) => candidate = Some(candidate.map_or(it, |c: HeapPtr| c.max(it))),
                }
            }
            let candidate = candidate.unwrap();
            for key in &mut self.keys {
                key.advance_all_past(candidate)?;
            }
            if self.keys.iter().any(|k| k.current_min() != Some(candidate)) {
                continue;
            }

            let mut all_ok = true;
            let mut any_lossy = false;
            for key in &self.keys {
                let (ok, lossy) = key.consistent_at(candidate, self.opclass.as_ref())?;
                any_lossy |= lossy;
                all_ok &= ok;
            }

            let step_past = HeapPtr::new(candidate.block, candidate.offset.wrapping_add(1));
            for key in &mut self.keys {
                key.advance_all_past(step_past)?;
            }

            if all_ok {
                return Ok(Some((candidate, any_lossy)));
            }
        }
    }
}

impl Iterator for Scan {
    type Item = Result<(HeapPtr, bool)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(Some(v)) => Some(Ok(v)),
            Ok(None) => None,
            Err(e) => {
                self.exhausted = true;
                Some(Err(e))
            }
        }
    }
}

/// Full scan by auxiliary ordering (spec.md §4.7): every posting for
/// `attr`, ranked ascending by `opclass.ordering`.
///
/// This build materializes the whole attribute's posting set up front
/// rather than streaming a posting tree that is itself stored in `(aux,
/// HeapPtr)` order (spec.md §3's "composite key when an add-to-column
/// ordering attribute is configured") — this crate's posting trees are
/// always `HeapPtr`-ordered, so a true streaming aux-ordered walk would
/// need a second posting-tree mode this build does not add.
pub struct FullScan {
    items: std::vec::IntoIter<(HeapPtr, f64)>,
}

impl FullScan {
    pub fn new(store: &Arc<PageStore>, opclass: &Arc<dyn OpClass>, cfg: &Config, attr: u16) -> Result<FullScan> {
        let desc = AttrDescriptor::varlena();
        let dispatch = EntryDispatch {
            store: store.clone(),
            opclass: opclass.clone(),
            cfg: cfg.clone(),
        };
        let mut block = dispatch.root();
        while !dispatch.is_leaf(block)? {
            block = dispatch.leftmost_child(block)?;
        }

        let mut out = Vec::new();
        loop {
            let page = store.fetch(block)?;
            let body = page.body.read().unwrap();
            let leaf = match &*body {
                PageBody::EntryLeaf(p) => p,
                _ => return Err(Error::invariant("expected entry leaf during full scan")),
            };
            for tuple in &leaf.tuples {
                if tuple.key.attr != attr {
                    continue;
                }
                let postings = match &tuple.posting {
                    PostingRef::Inline(items) => items.clone(),
                    PostingRef::Tree(root) => collect_all_postings(store, &desc, *root)?,
                };
                for p in postings {
                    let rank = opclass.ordering(attr, std::slice::from_ref(&p.aux));
                    out.push((p.ptr, rank));
                }
            }
            let next = leaf.opaque.right_link;
            drop(body);
            if next == INVALID_BLOCK {
                break;
            }
            block = next;
        }
        out.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(CmpOrdering::Equal));
        Ok(FullScan { items: out.into_iter() })
    }
}

impl Iterator for FullScan {
    type Item = (HeapPtr, f64);

    fn next(&mut self) -> Option<Self::Item> {
        self.items.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering as StdOrdering;

    use crate::model::Category;
    use crate::opclass::{ExtractedEntry, OpClassCapabilities};

    /// Exact-match opclass: the query bytes themselves are the key, and
    /// `consistent` just requires every entry (there is exactly one) to
    /// currently match.
    struct ExactOpClass;

    impl OpClass for ExactOpClass {
        fn extract_value(&self, _attr: u16, _value: &[u8]) -> Result<Vec<ExtractedEntry>> {
            Ok(Vec::new())
        }
        fn extract_query(&self, attr: u16, query: &[u8]) -> Result<Vec<crate::opclass::QueryEntry>> {
            Ok(vec![crate::opclass::QueryEntry {
                key: Key::norm(attr, Box::from(query)),
                is_partial: false,
                predicted_count: None,
            }])
        }
        fn compare(&self, _attr: u16, a: &[u8], b: &[u8]) -> StdOrdering {
            a.cmp(b)
        }
        fn consistent(&self, _attr: u16, _query_key: &[u8], _category: Category, state: &MatchState) -> Result<bool> {
            Ok(state.matches.iter().all(|&m| m))
        }
        fn capabilities(&self, _attr: u16) -> OpClassCapabilities {
            OpClassCapabilities::default()
        }
    }

    fn test_store(name: &str) -> (Arc<PageStore>, Arc<dyn OpClass>, Config) {
        let mut dir = std::env::temp_dir();
        dir.push("rum-test-scan");
        let mut cfg = Config::new(dir.to_str().unwrap(), name);
        cfg.blk_sz = 512;
        let store = Arc::new(PageStore::create(cfg.clone()).unwrap());
        (store, Arc::new(ExactOpClass), cfg)
    }

    fn key(k: u32) -> Key {
        Key::norm(1, Box::from(k.to_be_bytes()))
    }

    #[test]
    fn regular_scan_finds_exact_match_postings() {
        let (store, opclass, cfg) = test_store("regular");
        crate::entry_tree::insert(
            &store,
            &opclass,
            &cfg,
            key(7),
            vec![Posting::new(HeapPtr::new(1, 1), Aux::none()), Posting::new(HeapPtr::new(1, 2), Aux::none())],
        )
        .unwrap();
        crate::entry_tree::insert(&store, &opclass, &cfg, key(9), vec![Posting::new(HeapPtr::new(2, 1), Aux::none())]).unwrap();

        let query = 7u32.to_be_bytes();
        let mut scan = Scan::new(&store, &opclass, &cfg, 1, &query).unwrap();
        let mut found = Vec::new();
        while let Some((ptr, lossy)) = scan.advance().unwrap() {
            assert!(!lossy);
            found.push(ptr);
        }
        assert_eq!(found, vec![HeapPtr::new(1, 1), HeapPtr::new(1, 2)]);
    }

    #[test]
    fn regular_scan_on_missing_key_yields_nothing() {
        let (store, opclass, cfg) = test_store("missing");
        crate::entry_tree::insert(&store, &opclass, &cfg, key(3), vec![Posting::new(HeapPtr::new(1, 1), Aux::none())]).unwrap();

        let query = 99u32.to_be_bytes();
        let mut scan = Scan::new(&store, &opclass, &cfg, 1, &query).unwrap();
        assert!(scan.advance().unwrap().is_none());
    }
}
