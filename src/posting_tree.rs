//! Posting tree (spec.md §4.5): a standalone B-tree of `DataLeafPage`/
//! `DataInternalPage`s keyed by `HeapPtr`, used once an entry tuple's
//! inline posting list outgrows `Config::max_item_size`.
//!
//! Leaf splits use a byte-based midpoint (spec.md §4.5 "bytes-based leaf
//! split policy") rather than splitting the item count in half, since
//! items vary in encoded size once aux payloads are involved. Structural
//! placement (fits/split/propagate, root promotion) is delegated to the
//! same generic B-tree core `entry_tree.rs` uses.

use std::sync::Arc;

use crate::btree::{self, Dispatch};
use crate::codec::{AttrDescriptor, ItemCodec};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{HeapPtr, Posting, PostingChildPtr};
use crate::page::{DataInternalPage, DataLeafPage, INVALID_BLOCK};
use crate::store::{PageBody, PageStore};

/// Cap on an internal posting-tree node's fanout during bulk build; not a
/// hard on-disk limit (an internal page's `fits` check is count-based and
/// generous), just how wide a level we pack before starting the next one.
const BUILD_INTERNAL_FANOUT: usize = 200;

pub enum PostingItem {
    Leaf(Posting),
    Down(PostingChildPtr),
}

/// Handle to one posting tree, rooted at a fixed block (the block an
/// entry tuple's `PostingRef::Tree(root)` points at). The root's block
/// number never changes even when the root page's content is promoted
/// from leaf to internal by a split, mirroring the entry tree's own
/// fixed-root-block convention.
pub struct PostingTree {
    store: Arc<PageStore>,
    cfg: Config,
    root: u32,
}

impl PostingTree {
    pub fn at(store: Arc<PageStore>, cfg: Config, root: u32) -> PostingTree {
        PostingTree { store, cfg, root }
    }

    pub fn root_block(&self) -> u32 {
        self.root
    }

    /// Lock-coupled descent to the leaf covering `target`, exposing the
    /// generic B-tree core's ancestor stack to callers outside this module
    /// (vacuum's page-deletion pass needs the parent to unlink a deleted
    /// leaf; spec.md §4.6).
    pub fn locate(&self, target: HeapPtr, desc: &AttrDescriptor) -> Result<(u32, Vec<u32>)> {
        let dispatch = PostingDispatch {
            store: self.store.clone(),
            cfg: self.cfg.clone(),
            desc: *desc,
            root: self.root,
        };
        btree::find_leaf(&dispatch, &target)
    }

    /// Insert `items` one at a time through the generic B-tree core
    /// (spec.md §4.5). Callers are expected to have already deduped
    /// against the existing posting set (`entry_tree::merge_dedup`); this
    /// function itself also tolerates re-inserting an existing `HeapPtr`
    /// by replacing its aux value.
    pub fn insert_batch(&self, items: &[Posting], desc: &AttrDescriptor) -> Result<()> {
        let dispatch = PostingDispatch {
            store: self.store.clone(),
            cfg: self.cfg.clone(),
            desc: *desc,
            root: self.root,
        };
        for item in items {
            btree::insert_value(&dispatch, &item.ptr, PostingItem::Leaf(item.clone()))?;
        }
        Ok(())
    }

    /// Bulk-build a fresh posting tree from an already-sorted, deduped
    /// item list (spec.md §4.5 "Build"), packing leaves to capacity
    /// rather than splitting one at a time. Returns the new tree's root
    /// block.
    pub fn build(store: Arc<PageStore>, cfg: Config, items: &[Posting], desc: &AttrDescriptor) -> Result<u32> {
        let leaf_chunks = pack_by_bytes(items, desc, DataLeafPage::capacity(&cfg));
        let mut leaf_blocks = Vec::with_capacity(leaf_chunks.len().max(1));
        let chunks = if leaf_chunks.is_empty() { vec![Vec::new()] } else { leaf_chunks };

        for chunk in &chunks {
            let block = store.extend()?;
            leaf_blocks.push((block, chunk.last().map(|p| p.ptr).unwrap_or(HeapPtr::MAX)));
        }
        for (i, (block, _)) in leaf_blocks.iter().enumerate() {
            let mut page = DataLeafPage::empty(cfg.micro_index_k);
            page.rebuild(&chunks[i], desc, &cfg)?;
            page.opaque.right_link = leaf_blocks.get(i + 1).map(|(b, _)| *b).unwrap_or(INVALID_BLOCK);
            page.opaque.left_link = if i == 0 { INVALID_BLOCK } else { leaf_blocks[i - 1].0 };
            store.store(*block, PageBody::DataLeaf(page))?;
        }

        let mut level: Vec<(u32, HeapPtr)> = leaf_blocks;
        while level.len() > 1 {
            let mut next_level = Vec::new();
            for group in level.chunks(BUILD_INTERNAL_FANOUT) {
                let block = store.extend()?;
                let mut page = DataInternalPage::empty();
                page.children = group
                    .iter()
                    .map(|(child, sep)| PostingChildPtr {
                        child_block: *child,
                        separator: *sep,
                    })
                    .collect();
                page.recompute();
                let bound = page.right_bound;
                store.store(block, PageBody::DataInternal(page))?;
                next_level.push((block, bound));
            }
            level = next_level;
        }

        match level.into_iter().next() {
            Some((block, _)) => Ok(block),
            None => {
                let block = store.extend()?;
                let page = DataLeafPage::empty(cfg.micro_index_k);
                store.store(block, PageBody::DataLeaf(page))?;
                Ok(block)
            }
        }
    }
}

/// Greedily chunk `items` so each chunk's encoded byte size stays within
/// `capacity` (spec.md §4.5's bulk-build special case: every leaf but the
/// last is packed full).
fn pack_by_bytes(items: &[Posting], desc: &AttrDescriptor, capacity: usize) -> Vec<Vec<Posting>> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut size = 0usize;
    let mut prev = HeapPtr::MIN;
    for item in items {
        let item_size = ItemCodec::size(size, prev, item, desc);
        if !current.is_empty() && size + item_size > capacity {
            chunks.push(std::mem::take(&mut current));
            size = 0;
            prev = HeapPtr::MIN;
        }
        size += ItemCodec::size(size, prev, item, desc);
        prev = item.ptr;
        current.push(item.clone());
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

struct PostingDispatch {
    store: Arc<PageStore>,
    cfg: Config,
    desc: AttrDescriptor,
    root: u32,
}

impl PostingDispatch {
    fn with_leaf<R>(&self, block: u32, f: impl FnOnce(&DataLeafPage) -> R) -> Result<R> {
        let page = self.store.fetch(block)?;
        let body = page.body.read().unwrap();
        match &*body {
            PageBody::DataLeaf(p) => Ok(f(p)),
            _ => Err(Error::invariant(format!("block {} is not a posting leaf", block))),
        }
    }

    fn with_internal<R>(&self, block: u32, f: impl FnOnce(&DataInternalPage) -> R) -> Result<R> {
        let page = self.store.fetch(block)?;
        let body = page.body.read().unwrap();
        match &*body {
            PageBody::DataInternal(p) => Ok(f(p)),
            _ => Err(Error::invariant(format!("block {} is not a posting internal node", block))),
        }
    }

    fn merged_sorted(&self, block: u32, new_item: &Posting) -> Result<Vec<Posting>> {
        self.with_leaf(block, |leaf| {
            let mut items = leaf.decode_all(&self.desc)?;
            insert_sorted(&mut items, new_item.clone());
            Ok(items)
        })?
    }
}

fn insert_sorted(items: &mut Vec<Posting>, item: Posting) {
    match items.binary_search_by_key(&item.ptr, |p| p.ptr) {
        Ok(i) => items[i] = item,
        Err(i) => items.insert(i, item),
    }
}

impl Dispatch for PostingDispatch {
    type Key = HeapPtr;
    type Item = PostingItem;

    fn root(&self) -> u32 {
        self.root
    }

    fn is_leaf(&self, block: u32) -> Result<bool> {
        let page = self.store.fetch(block)?;
        let body = page.body.read().unwrap();
        Ok(matches!(&*body, PageBody::DataLeaf(_)))
    }

    fn right_link(&self, block: u32) -> Result<u32> {
        let page = self.store.fetch(block)?;
        Ok(page.body.read().unwrap().right_link())
    }

    fn is_deleted(&self, block: u32) -> Result<bool> {
        let page = self.store.fetch(block)?;
        Ok(page.body.read().unwrap().is_deleted())
    }

    fn is_move_right(&self, block: u32, key: &HeapPtr) -> Result<bool> {
        let page = self.store.fetch(block)?;
        let body = page.body.read().unwrap();
        let right_bound = match &*body {
            PageBody::DataLeaf(p) => p.right_bound,
            PageBody::DataInternal(p) => p.right_bound,
            _ => return Err(Error::invariant("not a posting page")),
        };
        Ok(right_bound < *key)
    }

    fn find_child(&self, block: u32, key: &HeapPtr) -> Result<u32> {
        self.with_internal(block, |p| p.find_child(*key))?
    }

    fn leftmost_child(&self, block: u32) -> Result<u32> {
        self.with_internal(block, |p| p.children.first().map(|c| c.child_block))?
            .ok_or_else(|| Error::invariant("posting internal node has no children"))
    }

    fn fits(&self, block: u32, item: &PostingItem) -> Result<bool> {
        match item {
            PostingItem::Leaf(p) => {
                let merged = self.merged_sorted(block, p)?;
                let mut scratch = self.with_leaf(block, |l| l.clone())?;
                scratch.rebuild(&merged, &self.desc, &self.cfg)?;
                Ok(scratch.fits(0, &self.cfg))
            }
            PostingItem::Down(_) => self.with_internal(block, |p| p.children.len() < BUILD_INTERNAL_FANOUT * 4),
        }
    }

    fn place(&self, block: u32, item: PostingItem) -> Result<()> {
        match item {
            PostingItem::Leaf(p) => {
                let merged = self.merged_sorted(block, &p)?;
                let page = self.store.fetch(block)?;
                let mut body = page.body.write().unwrap();
                if let PageBody::DataLeaf(leaf) = &mut *body {
                    leaf.rebuild(&merged, &self.desc, &self.cfg)?;
                    Ok(())
                } else {
                    Err(Error::invariant("expected posting leaf in place()"))
                }
            }
            PostingItem::Down(d) => {
                let page = self.store.fetch(block)?;
                let mut body = page.body.write().unwrap();
                if let PageBody::DataInternal(internal) = &mut *body {
                    internal.children.push(d);
                    internal.children.sort_by_key(|c| c.separator);
                    internal.recompute();
                    Ok(())
                } else {
                    Err(Error::invariant("expected posting internal node in place()"))
                }
            }
        }
    }

    fn split(&self, block: u32, item: PostingItem, left_target: u32) -> Result<(u32, HeapPtr)> {
        let right_block = self.store.extend()?;
        match item {
            PostingItem::Leaf(p) => {
                let merged = self.merged_sorted(block, &p)?;
                let old_right_link = self.with_leaf(block, |l| l.opaque.right_link)?;

                let capacity = DataLeafPage::capacity(&self.cfg);
                let mid = byte_midpoint(&merged, &self.desc, capacity);
                let (left_items, right_items) = merged.split_at(mid);

                let mut left_page = DataLeafPage::empty(self.cfg.micro_index_k);
                left_page.rebuild(left_items, &self.desc, &self.cfg)?;
                left_page.opaque.right_link = right_block;
                left_page.opaque.left_link = self.with_leaf(block, |l| l.opaque.left_link)?;

                let mut right_page = DataLeafPage::empty(self.cfg.micro_index_k);
                right_page.rebuild(right_items, &self.desc, &self.cfg)?;
                right_page.opaque.right_link = old_right_link;
                right_page.opaque.left_link = left_target;
                let separator = right_page.right_bound;

                self.store.store(left_target, PageBody::DataLeaf(left_page))?;
                self.store.store(right_block, PageBody::DataLeaf(right_page))?;
                Ok((right_block, separator))
            }
            PostingItem::Down(d) => {
                let mut children = self.with_internal(block, |p| p.children.clone())?;
                children.push(d);
                children.sort_by_key(|c| c.separator);
                let mid = children.len() / 2;
                let right_children = children.split_off(mid);
                let old_right_link = self.with_internal(block, |p| p.opaque.right_link)?;

                let mut left_page = DataInternalPage::empty();
                left_page.children = children;
                left_page.recompute();
                left_page.opaque.right_link = right_block;

                let mut right_page = DataInternalPage::empty();
                right_page.children = right_children;
                right_page.recompute();
                right_page.opaque.right_link = old_right_link;
                let separator = right_page.right_bound;

                self.store.store(left_target, PageBody::DataInternal(left_page))?;
                self.store.store(right_block, PageBody::DataInternal(right_page))?;
                Ok((right_block, separator))
            }
        }
    }

    fn fill_root(&self, root: u32, left: u32, right: u32, right_key: HeapPtr) -> Result<()> {
        let left_key = self
            .with_internal(left, |p| p.right_bound)
            .or_else(|_| self.with_leaf(left, |p| p.right_bound))?;
        let mut new_root = DataInternalPage::empty();
        new_root.children.push(PostingChildPtr {
            child_block: left,
            separator: left_key,
        });
        new_root.children.push(PostingChildPtr {
            child_block: right,
            separator: right_key,
        });
        new_root.recompute();
        new_root.opaque.right_link = INVALID_BLOCK;
        self.store.store(root, PageBody::DataInternal(new_root))
    }

    fn find_child_ptr(&self, parent: u32, child: u32) -> Result<()> {
        let found = self.with_internal(parent, |p| p.children.iter().any(|c| c.child_block == child))?;
        if found {
            Ok(())
        } else {
            Err(Error::invariant("posting downlink not found at expected parent"))
        }
    }

    fn downlink_item(&self, child: u32, separator: HeapPtr) -> PostingItem {
        PostingItem::Down(PostingChildPtr {
            child_block: child,
            separator,
        })
    }

    fn new_block(&self) -> Result<u32> {
        self.store.extend()
    }
}

/// Find the split point in an already-sorted item list so the left half's
/// encoded size is close to `capacity / 2` (spec.md §4.5 bytes-based leaf
/// split), rather than just halving the item count.
fn byte_midpoint(items: &[Posting], desc: &AttrDescriptor, capacity: usize) -> usize {
    let target = capacity / 2;
    let mut size = 0;
    let mut prev = HeapPtr::MIN;
    for (i, item) in items.iter().enumerate() {
        let item_size = ItemCodec::size(size, prev, item, desc);
        if size + item_size > target && i > 0 {
            return i;
        }
        size += item_size;
        prev = item.ptr;
    }
    (items.len() / 2).max(1).min(items.len().saturating_sub(1).max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Aux;

    fn test_store(name: &str) -> (Arc<PageStore>, Config) {
        let mut dir = std::env::temp_dir();
        dir.push("rum-test-posting-tree");
        let mut cfg = Config::new(dir.to_str().unwrap(), name);
        cfg.blk_sz = 512; // small page, so a handful of postings forces a split
        let store = Arc::new(PageStore::create(cfg.clone()).unwrap());
        (store, cfg)
    }

    fn posting(block: u32, offset: u16) -> Posting {
        Posting::new(HeapPtr::new(block, offset), Aux::none())
    }

    #[test]
    fn build_then_decode_round_trips_in_order() {
        let (store, cfg) = test_store("build");
        let desc = AttrDescriptor::varlena();
        let items: Vec<Posting> = (0..50u32).map(|i| posting(i, 1)).collect();
        let root = PostingTree::build(store.clone(), cfg.clone(), &items, &desc).unwrap();

        let mut decoded = Vec::new();
        let mut block = root;
        loop {
            let page = store.fetch(block).unwrap();
            let body = page.body.read().unwrap();
            match &*body {
                PageBody::DataLeaf(p) => {
                    decoded.extend(p.decode_all(&desc).unwrap().into_iter().map(|p| p.ptr));
                    let next = p.opaque.right_link;
                    drop(body);
                    if next == INVALID_BLOCK {
                        break;
                    }
                    block = next;
                }
                PageBody::DataInternal(p) => {
                    let next = p.children.first().unwrap().child_block;
                    drop(body);
                    block = next;
                }
                _ => panic!("unexpected page kind"),
            }
        }
        let expected: Vec<HeapPtr> = items.iter().map(|p| p.ptr).collect();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn insert_batch_splits_and_preserves_order() {
        let (store, cfg) = test_store("insert");
        let desc = AttrDescriptor::varlena();
        let root = PostingTree::build(store.clone(), cfg.clone(), &[], &desc).unwrap();
        let tree = PostingTree::at(store.clone(), cfg.clone(), root);

        let items: Vec<Posting> = (0..80u32).rev().map(|i| posting(i * 2, 1)).collect();
        // insert_batch requires ascending insertion order per item, but the
        // tree itself must end up holding every item sorted regardless of
        // the order they arrived in.
        let mut sorted = items.clone();
        sorted.sort_by_key(|p| p.ptr);
        tree.insert_batch(&sorted, &desc).unwrap();

        let mut decoded = Vec::new();
        let mut block = leftmost_data_leaf_for_test(&store, root);
        loop {
            let page = store.fetch(block).unwrap();
            let body = page.body.read().unwrap();
            let leaf = match &*body {
                PageBody::DataLeaf(p) => p,
                _ => panic!("expected leaf"),
            };
            decoded.extend(leaf.decode_all(&desc).unwrap().into_iter().map(|p| p.ptr));
            let next = leaf.opaque.right_link;
            drop(body);
            if next == INVALID_BLOCK {
                break;
            }
            block = next;
        }
        let expected: Vec<HeapPtr> = sorted.iter().map(|p| p.ptr).collect();
        assert_eq!(decoded, expected);
    }

    fn leftmost_data_leaf_for_test(store: &Arc<PageStore>, root: u32) -> u32 {
        let mut block = root;
        loop {
            let page = store.fetch(block).unwrap();
            let body = page.body.read().unwrap();
            match &*body {
                PageBody::DataLeaf(_) => return block,
                PageBody::DataInternal(p) => {
                    let next = p.children.first().unwrap().child_block;
                    drop(body);
                    block = next;
                }
                _ => panic!("unexpected page kind"),
            }
        }
    }

    #[test]
    fn locate_finds_leaf_covering_target() {
        let (store, cfg) = test_store("locate");
        let desc = AttrDescriptor::varlena();
        let items: Vec<Posting> = (0..60u32).map(|i| posting(i, 1)).collect();
        let root = PostingTree::build(store.clone(), cfg.clone(), &items, &desc).unwrap();
        let tree = PostingTree::at(store.clone(), cfg.clone(), root);

        let (leaf, _stack) = tree.locate(HeapPtr::new(59, 1), &desc).unwrap();
        let page = store.fetch(leaf).unwrap();
        let body = page.body.read().unwrap();
        match &*body {
            PageBody::DataLeaf(p) => assert!(p.right_bound >= HeapPtr::new(59, 1)),
            _ => panic!("expected leaf"),
        }
    }
}
