//! Entry tree (spec.md §4.4): the upper B-tree keyed by `(attr, category,
//! key)`, whose leaves either carry an inline posting list or a pointer
//! at a posting-tree root.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::btree::{self, Dispatch};
use crate::codec::{AttrDescriptor, ItemCodec};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{compare_keys, Category, EntryDownlink, EntryTuple, HeapPtr, Key, Posting, PostingRef};
use crate::opclass::OpClass;
use crate::page::{flags, Opaque, INVALID_BLOCK};
use crate::posting_tree::PostingTree;
use crate::store::PageStore;

#[derive(Clone)]
pub struct EntryLeafPage {
    pub right_bound: Key,
    pub tuples: Vec<EntryTuple>,
    pub opaque: Opaque,
}

impl EntryLeafPage {
    pub fn empty() -> EntryLeafPage {
        EntryLeafPage {
            right_bound: Key::placeholder(u16::MAX, Category::NullItem),
            tuples: Vec::new(),
            opaque: Opaque::new(flags::DATA | flags::LEAF),
        }
    }

    pub fn encoded_size(&self, desc: &AttrDescriptor) -> usize {
        self.tuples.iter().map(|t| tuple_size(t, desc)).sum()
    }
}

#[derive(Clone)]
pub struct EntryInternalPage {
    pub right_bound: Key,
    pub downlinks: Vec<EntryDownlink>,
    pub opaque: Opaque,
}

impl EntryInternalPage {
    pub fn empty() -> EntryInternalPage {
        EntryInternalPage {
            right_bound: Key::placeholder(u16::MAX, Category::NullItem),
            downlinks: Vec::new(),
            opaque: Opaque::new(flags::DATA),
        }
    }
}

fn tuple_size(t: &EntryTuple, desc: &AttrDescriptor) -> usize {
    let base = 2 + 1 + t.key.datum.len() + 2; // attr + category + datum + n_posting
    let postings = match &t.posting {
        PostingRef::Inline(items) => {
            let mut prev = HeapPtr::MIN;
            let mut size = 0;
            for item in items {
                size += ItemCodec::size(size, prev, item, desc);
                prev = item.ptr;
            }
            size
        }
        PostingRef::Tree(_) => 4,
    };
    base + postings
}

fn cmp(opclass: &dyn OpClass, a: &Key, b: &Key) -> Ordering {
    compare_keys(a, b, |attr, x, y| opclass.compare(attr, x, y))
}

/// The `entry_tree` instantiation of the generic B-tree dispatch table
/// (spec.md §4.3 Design Notes: one of the two tree variants).
pub struct EntryDispatch {
    pub store: Arc<PageStore>,
    pub opclass: Arc<dyn OpClass>,
    pub cfg: Config,
}

pub enum EntryItem {
    Leaf(EntryTuple),
    Down(EntryDownlink),
}

impl EntryDispatch {
    fn with_leaf<R>(&self, block: u32, f: impl FnOnce(&EntryLeafPage) -> R) -> Result<R> {
        let page = self.store.fetch(block)?;
        let body = page.body.read().unwrap();
        match &*body {
            crate::store::PageBody::EntryLeaf(p) => Ok(f(p)),
            _ => Err(Error::invariant(format!("block {} is not an entry leaf", block))),
        }
    }

    fn with_internal<R>(&self, block: u32, f: impl FnOnce(&EntryInternalPage) -> R) -> Result<R> {
        let page = self.store.fetch(block)?;
        let body = page.body.read().unwrap();
        match &*body {
            crate::store::PageBody::EntryInternal(p) => Ok(f(p)),
            _ => Err(Error::invariant(format!("block {} is not an entry internal node", block))),
        }
    }

    fn desc(&self) -> AttrDescriptor {
        AttrDescriptor::varlena()
    }

    /// Find the existing tuple (if any) in `block`'s leaf matching `key`.
    pub fn find_in_leaf(&self, block: u32, key: &Key) -> Result<Option<EntryTuple>> {
        self.with_leaf(block, |p| {
            p.tuples.iter().find(|t| cmp(self.opclass.as_ref(), &t.key, key) == Ordering::Equal).cloned()
        })
    }

    /// Remove any tuple matching `key` from `block`'s leaf (used before
    /// re-inserting a merged/converted replacement).
    pub fn remove_from_leaf(&self, block: u32, key: &Key) -> Result<()> {
        let page = self.store.fetch(block)?;
        let mut body = page.body.write().unwrap();
        if let crate::store::PageBody::EntryLeaf(p) = &mut *body {
            p.tuples.retain(|t| cmp(self.opclass.as_ref(), &t.key, key) != Ordering::Equal);
            recompute_leaf(p, self.opclass.as_ref());
        }
        Ok(())
    }
}

impl Dispatch for EntryDispatch {
    type Key = Key;
    type Item = EntryItem;

    fn root(&self) -> u32 {
        crate::store::ENTRY_ROOT_BLOCK
    }

    fn is_leaf(&self, block: u32) -> Result<bool> {
        let page = self.store.fetch(block)?;
        let body = page.body.read().unwrap();
        Ok(matches!(&*body, crate::store::PageBody::EntryLeaf(_)))
    }

    fn right_link(&self, block: u32) -> Result<u32> {
        let page = self.store.fetch(block)?;
        let body = page.body.read().unwrap();
        Ok(body.right_link())
    }

    fn is_deleted(&self, block: u32) -> Result<bool> {
        let page = self.store.fetch(block)?;
        Ok(page.body.read().unwrap().is_deleted())
    }

    fn is_move_right(&self, block: u32, key: &Key) -> Result<bool> {
        let page = self.store.fetch(block)?;
        let body = page.body.read().unwrap();
        let right_bound = match &*body {
            crate::store::PageBody::EntryLeaf(p) => &p.right_bound,
            crate::store::PageBody::EntryInternal(p) => &p.right_bound,
            _ => return Err(Error::invariant("not an entry page")),
        };
        Ok(cmp(self.opclass.as_ref(), right_bound, key) == Ordering::Less)
    }

    fn find_child(&self, block: u32, key: &Key) -> Result<u32> {
        self.with_internal(block, |p| {
            p.downlinks
                .iter()
                .find(|d| cmp(self.opclass.as_ref(), &d.key, key) != Ordering::Less)
                .or_else(|| p.downlinks.last())
                .map(|d| d.child_block)
        })?
        .ok_or_else(|| Error::invariant("entry internal node has no downlinks"))
    }

    fn leftmost_child(&self, block: u32) -> Result<u32> {
        self.with_internal(block, |p| p.downlinks.first().map(|d| d.child_block))?
            .ok_or_else(|| Error::invariant("entry internal node has no downlinks"))
    }

    fn fits(&self, block: u32, item: &EntryItem) -> Result<bool> {
        let desc = self.desc();
        match item {
            EntryItem::Leaf(t) => self.with_leaf(block, |p| {
                p.encoded_size(&desc) + tuple_size(t, &desc) <= self.cfg.blk_sz / 2
            }),
            EntryItem::Down(_) => self.with_internal(block, |p| p.downlinks.len() < 256),
        }
    }

    fn place(&self, block: u32, item: EntryItem) -> Result<()> {
        let page = self.store.fetch(block)?;
        let mut body = page.body.write().unwrap();
        match (&mut *body, item) {
            (crate::store::PageBody::EntryLeaf(p), EntryItem::Leaf(t)) => {
                p.tuples.retain(|existing| cmp(self.opclass.as_ref(), &existing.key, &t.key) != Ordering::Equal);
                p.tuples.push(t);
                recompute_leaf(p, self.opclass.as_ref());
                Ok(())
            }
            (crate::store::PageBody::EntryInternal(p), EntryItem::Down(d)) => {
                p.downlinks.push(d);
                recompute_internal(p, self.opclass.as_ref());
                Ok(())
            }
            _ => Err(Error::invariant("entry tree item/page kind mismatch")),
        }
    }

    fn split(&self, block: u32, item: EntryItem, left_target: u32) -> Result<(u32, Key)> {
        let right_block = self.store.extend()?;
        let page = self.store.fetch(block)?;
        let mut body = page.body.write().unwrap();
        match (&mut *body, item) {
            (crate::store::PageBody::EntryLeaf(p), EntryItem::Leaf(t)) => {
                p.tuples.retain(|existing| cmp(self.opclass.as_ref(), &existing.key, &t.key) != Ordering::Equal);
                p.tuples.push(t);
                p.tuples.sort_by(|a, b| cmp(self.opclass.as_ref(), &a.key, &b.key));
                let mid = p.tuples.len() / 2;
                let right_tuples = p.tuples.split_off(mid);
                recompute_leaf(p, self.opclass.as_ref());

                let mut right_page = EntryLeafPage::empty();
                right_page.opaque.right_link = p.opaque.right_link;
                right_page.opaque.left_link = left_target;
                right_page.tuples = right_tuples;
                recompute_leaf(&mut right_page, self.opclass.as_ref());
                let separator = right_page.right_bound.clone();

                p.opaque.right_link = right_block;
                let left_image = p.clone();
                drop(body);
                self.store.store(left_target, crate::store::PageBody::EntryLeaf(left_image))?;
                self.store.store(right_block, crate::store::PageBody::EntryLeaf(right_page))?;
                Ok((right_block, separator))
            }
            (crate::store::PageBody::EntryInternal(p), EntryItem::Down(d)) => {
                p.downlinks.push(d);
                p.downlinks.sort_by(|a, b| cmp(self.opclass.as_ref(), &a.key, &b.key));
                let mid = p.downlinks.len() / 2;
                let right_downlinks = p.downlinks.split_off(mid);
                recompute_internal(p, self.opclass.as_ref());

                let mut right_page = EntryInternalPage::empty();
                right_page.opaque.right_link = p.opaque.right_link;
                right_page.downlinks = right_downlinks;
                recompute_internal(&mut right_page, self.opclass.as_ref());
                let separator = right_page.right_bound.clone();

                p.opaque.right_link = right_block;
                let left_image = p.clone();
                drop(body);
                self.store.store(left_target, crate::store::PageBody::EntryInternal(left_image))?;
                self.store.store(right_block, crate::store::PageBody::EntryInternal(right_page))?;
                Ok((right_block, separator))
            }
            _ => Err(Error::invariant("entry tree item/page kind mismatch during split")),
        }
    }

    fn fill_root(&self, root: u32, left: u32, right: u32, right_key: Key) -> Result<()> {
        let left_key = self.with_internal(left, |p| p.right_bound.clone()).or_else(|_| self.with_leaf(left, |p| p.right_bound.clone()))?;
        let mut new_root = EntryInternalPage::empty();
        new_root.downlinks.push(EntryDownlink {
            key: left_key,
            child_block: left,
        });
        new_root.downlinks.push(EntryDownlink {
            key: right_key,
            child_block: right,
        });
        new_root.opaque.right_link = INVALID_BLOCK;
        recompute_internal(&mut new_root, self.opclass.as_ref());
        self.store.store(root, crate::store::PageBody::EntryInternal(new_root))
    }

    fn find_child_ptr(&self, parent: u32, child: u32) -> Result<()> {
        let found = self.with_internal(parent, |p| p.downlinks.iter().any(|d| d.child_block == child))?;
        if found {
            Ok(())
        } else {
            Err(Error::invariant("downlink not found at expected parent"))
        }
    }

    fn downlink_item(&self, child: u32, separator: Key) -> EntryItem {
        EntryItem::Down(EntryDownlink {
            key: separator,
            child_block: child,
        })
    }

    fn new_block(&self) -> Result<u32> {
        self.store.extend()
    }
}

fn recompute_leaf(p: &mut EntryLeafPage, opclass: &dyn OpClass) {
    p.tuples.sort_by(|a, b| cmp(opclass, &a.key, &b.key));
    p.opaque.max_offset = p.tuples.len() as u16;
    if let Some(last) = p.tuples.last() {
        p.right_bound = last.key.clone();
    }
}

fn recompute_internal(p: &mut EntryInternalPage, opclass: &dyn OpClass) {
    p.downlinks.sort_by(|a, b| cmp(opclass, &a.key, &b.key));
    p.opaque.max_offset = p.downlinks.len() as u16;
    if let Some(last) = p.downlinks.last() {
        p.right_bound = last.key.clone();
    }
}

/// Insert `(key, items)` into the entry tree (spec.md §4.4). Handles the
/// inline-merge, posting-tree-delegate and inline-to-tree-conversion
/// cases; structural placement (fits/split/propagate) is delegated to
/// the generic B-tree core.
pub fn insert(
    store: &Arc<PageStore>,
    opclass: &Arc<dyn OpClass>,
    cfg: &Config,
    key: Key,
    items: Vec<Posting>,
) -> Result<()> {
    let dispatch = EntryDispatch {
        store: store.clone(),
        opclass: opclass.clone(),
        cfg: cfg.clone(),
    };
    let (leaf, _stack) = btree::find_leaf(&dispatch, &key)?;
    let existing = dispatch.find_in_leaf(leaf, &key)?;
    let desc = dispatch.desc();

    match existing {
        Some(EntryTuple {
            posting: PostingRef::Tree(root),
            ..
        }) => {
            let tree = PostingTree::at(store.clone(), cfg.clone(), root);
            tree.insert_batch(&items, &desc)
        }
        Some(EntryTuple {
            posting: PostingRef::Inline(mut old_items),
            ..
        }) => {
            merge_dedup(&mut old_items, items);
            let merged = EntryTuple {
                key: key.clone(),
                posting: PostingRef::Inline(old_items),
            };
            if tuple_size(&merged, &desc) <= cfg.max_item_size() {
                dispatch.remove_from_leaf(leaf, &key)?;
                btree::insert_value(&dispatch, &key, EntryItem::Leaf(merged))
            } else {
                let root = match merged.posting {
                    PostingRef::Inline(all) => PostingTree::build(store.clone(), cfg.clone(), &all, &desc)?,
                    PostingRef::Tree(_) => unreachable!(),
                };
                dispatch.remove_from_leaf(leaf, &key)?;
                let converted = EntryTuple {
                    key: key.clone(),
                    posting: PostingRef::Tree(root),
                };
                btree::insert_value(&dispatch, &key, EntryItem::Leaf(converted))
            }
        }
        None => {
            let tuple_if_inline = EntryTuple {
                key: key.clone(),
                posting: PostingRef::Inline(items.clone()),
            };
            if tuple_size(&tuple_if_inline, &desc) <= cfg.max_item_size() {
                btree::insert_value(&dispatch, &key, EntryItem::Leaf(tuple_if_inline))
            } else {
                let root = PostingTree::build(store.clone(), cfg.clone(), &items, &desc)?;
                let tuple = EntryTuple {
                    key: key.clone(),
                    posting: PostingRef::Tree(root),
                };
                btree::insert_value(&dispatch, &key, EntryItem::Leaf(tuple))
            }
        }
    }
}

/// Merge `new` into `old`, both already sorted by `HeapPtr`, dropping
/// duplicates (spec.md §4.4 step 2, and the posting-tree-dedup property
/// from spec.md §8).
pub fn merge_dedup(old: &mut Vec<Posting>, new: Vec<Posting>) {
    old.extend(new);
    old.sort_by_key(|p| p.ptr);
    old.dedup_by_key(|p| p.ptr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Aux;
    use crate::opclass::{ExtractedEntry, MatchState, OpClassCapabilities, QueryEntry};

    /// Plain byte-lexicographic opclass, just enough to exercise tree
    /// structure and ordering; no extraction/consistency logic needed by
    /// these tests.
    struct BytesOpClass;

    impl OpClass for BytesOpClass {
        fn extract_value(&self, _attr: u16, _value: &[u8]) -> Result<Vec<ExtractedEntry>> {
            Ok(Vec::new())
        }
        fn extract_query(&self, _attr: u16, _query: &[u8]) -> Result<Vec<QueryEntry>> {
            Ok(Vec::new())
        }
        fn compare(&self, _attr: u16, a: &[u8], b: &[u8]) -> Ordering {
            a.cmp(b)
        }
        fn consistent(&self, _attr: u16, _query_key: &[u8], _category: Category, _state: &MatchState) -> Result<bool> {
            Ok(true)
        }
        fn capabilities(&self, _attr: u16) -> OpClassCapabilities {
            OpClassCapabilities::default()
        }
    }

    fn test_store(name: &str) -> (Arc<PageStore>, Arc<dyn OpClass>, Config) {
        let mut dir = std::env::temp_dir();
        dir.push("rum-test-entry-tree");
        let mut cfg = Config::new(dir.to_str().unwrap(), name);
        cfg.blk_sz = 512;
        let store = Arc::new(PageStore::create(cfg.clone()).unwrap());
        (store, Arc::new(BytesOpClass), cfg)
    }

    fn key(k: u32) -> Key {
        Key::norm(1, Box::from(k.to_be_bytes()))
    }

    fn posting(offset: u16) -> Posting {
        Posting::new(HeapPtr::new(1, offset), Aux::none())
    }

    fn all_keys_in_order(store: &Arc<PageStore>) -> Vec<Box<[u8]>> {
        let mut out = Vec::new();
        let mut block = crate::store::ENTRY_ROOT_BLOCK;
        // descend to the leftmost leaf
        loop {
            let page = store.fetch(block).unwrap();
            let body = page.body.read().unwrap();
            match &*body {
                crate::store::PageBody::EntryLeaf(_) => break,
                crate::store::PageBody::EntryInternal(p) => {
                    let next = p.downlinks.first().unwrap().child_block;
                    drop(body);
                    block = next;
                }
                _ => panic!("unexpected page kind"),
            }
        }
        loop {
            let page = store.fetch(block).unwrap();
            let body = page.body.read().unwrap();
            let leaf = match &*body {
                crate::store::PageBody::EntryLeaf(p) => p,
                _ => panic!("expected entry leaf"),
            };
            for t in &leaf.tuples {
                out.push(t.key.datum.clone());
            }
            let next = leaf.opaque.right_link;
            drop(body);
            if next == INVALID_BLOCK {
                break;
            }
            block = next;
        }
        out
    }

    #[test]
    fn insert_keeps_keys_sorted_across_splits() {
        let (store, opclass, cfg) = test_store("sorted");
        let mut order: Vec<u32> = (0..120).collect();
        // insert out of order to exercise splits at arbitrary points
        order.sort_by_key(|k| (k % 7, *k));
        for k in order {
            insert(&store, &opclass, &cfg, key(k), vec![posting(1)]).unwrap();
        }

        let observed = all_keys_in_order(&store);
        let mut expected: Vec<Box<[u8]>> = (0..120u32).map(|k| Box::from(k.to_be_bytes())).collect();
        expected.sort();
        assert_eq!(observed, expected);
    }

    #[test]
    fn repeated_insert_merges_and_dedups_inline_postings() {
        let (store, opclass, cfg) = test_store("merge");
        insert(&store, &opclass, &cfg, key(1), vec![posting(1), posting(2)]).unwrap();
        insert(&store, &opclass, &cfg, key(1), vec![posting(2), posting(3)]).unwrap();

        let dispatch = EntryDispatch {
            store: store.clone(),
            opclass: opclass.clone(),
            cfg: cfg.clone(),
        };
        let (leaf, _) = btree::find_leaf(&dispatch, &key(1)).unwrap();
        let tuple = dispatch.find_in_leaf(leaf, &key(1)).unwrap().unwrap();
        match tuple.posting {
            PostingRef::Inline(items) => {
                let ptrs: Vec<HeapPtr> = items.iter().map(|p| p.ptr).collect();
                assert_eq!(ptrs, vec![HeapPtr::new(1, 1), HeapPtr::new(1, 2), HeapPtr::new(1, 3)]);
            }
            PostingRef::Tree(_) => panic!("expected inline posting list"),
        }
    }

    #[test]
    fn oversized_inline_list_converts_to_posting_tree() {
        let (store, opclass, cfg) = test_store("convert");
        let items: Vec<Posting> = (0..500u16).map(posting).collect();
        insert(&store, &opclass, &cfg, key(1), items).unwrap();

        let dispatch = EntryDispatch {
            store: store.clone(),
            opclass: opclass.clone(),
            cfg: cfg.clone(),
        };
        let (leaf, _) = btree::find_leaf(&dispatch, &key(1)).unwrap();
        let tuple = dispatch.find_in_leaf(leaf, &key(1)).unwrap().unwrap();
        assert!(tuple.posting.is_tree());
    }
}

