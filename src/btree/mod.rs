//! Generic two-variant B-tree core (spec.md §4.3): lock-coupled descent,
//! right-link recovery after concurrent splits, parent rediscovery, and
//! structural inserts that split and propagate upward.
//!
//! The eight dispatch functions spec.md's Design Notes describe become
//! the `Dispatch` trait below; `entry_tree.rs` and `posting_tree.rs` each
//! provide one implementation, matching this codebase's long-standing
//! habit of expressing node-kind polymorphism as a small trait rather
//! than a vtable of raw function pointers (cf. `core::Serialize`/`Diff`).

pub mod latch;

use crate::error::{Error, Result};
use crate::page::INVALID_BLOCK;

/// The node-kind-specific operations a tree variant must supply. `Key` is
/// whatever this tree orders its leaves by (`(attr, category, key)` for
/// the entry tree, `HeapPtr` for a posting tree); `Item` is the unit a
/// single `place`/`split` call inserts (an entry tuple, or a posting-tree
/// downlink/leaf item).
pub trait Dispatch {
    type Key: Clone;
    type Item;

    fn root(&self) -> u32;
    fn is_leaf(&self, block: u32) -> Result<bool>;
    fn right_link(&self, block: u32) -> Result<u32>;
    fn is_deleted(&self, block: u32) -> Result<bool>;

    /// `true` if `key` falls to the right of this page's covered range,
    /// meaning a concurrent split left us on the wrong page and we must
    /// follow `right_link` (spec.md §4.3 step 1).
    fn is_move_right(&self, block: u32, key: &Self::Key) -> Result<bool>;

    /// Internal-node-only: which child subtree covers `key`.
    fn find_child(&self, block: u32, key: &Self::Key) -> Result<u32>;

    /// Leftmost child of an internal node (used by full-scan entries).
    fn leftmost_child(&self, block: u32) -> Result<u32>;

    /// Whether `item` can be placed into `block` without exceeding its
    /// capacity.
    fn fits(&self, block: u32, item: &Self::Item) -> Result<bool>;

    /// Insert `item` into `block` in place; caller has already verified
    /// `fits`.
    fn place(&self, block: u32, item: Self::Item) -> Result<()>;

    /// Split `block` (which does not fit `item`), writing the surviving
    /// left half into `left_target` (either `block` itself, or a freshly
    /// allocated page when `block` is the root and must keep its block
    /// number) and a freshly allocated right sibling. Returns the new
    /// right page's block number and its covering key (what a new
    /// downlink to the right page must read). The left half's own
    /// in-page `right_bound`/right-link are updated by this call too, so
    /// a stale parent downlink for `left_target` (still reading the
    /// pre-split upper bound) is harmless: any search key that now
    /// belongs to the right half will fail `is_move_right` on the left
    /// page and recover via `right_link` (spec.md §4.3 "Right-link
    /// recovery").
    fn split(&self, block: u32, item: Self::Item, left_target: u32) -> Result<(u32, Self::Key)>;

    /// Re-initialize `root` as an internal node whose two children are
    /// `left` and `right`, used the one time a split reaches the root.
    fn fill_root(&self, root: u32, left: u32, right: u32, right_key: Self::Key) -> Result<()>;

    /// Confirm `parent` still carries a downlink to `child`; used to
    /// detect a stale parent stack frame after a concurrent parent split.
    fn find_child_ptr(&self, parent: u32, child: u32) -> Result<()>;

    /// Build the `Item` representing a new downlink `(child, separator)`
    /// to be propagated into a parent internal node.
    fn downlink_item(&self, child: u32, separator: Self::Key) -> Self::Item;

    /// Allocate a fresh block (used for the new left image when a split
    /// reaches the root).
    fn new_block(&self) -> Result<u32>;
}

/// Follow `right_link` until the page's range covers `key`, erroring out
/// if a `DELETED` sibling is ever reached (spec.md §4.3 "Failure model").
pub fn recover_right<D: Dispatch>(d: &D, mut block: u32, key: &D::Key) -> Result<u32> {
    loop {
        if d.is_deleted(block)? {
            return Err(Error::invariant("sibling was deleted"));
        }
        if !d.is_move_right(block, key)? {
            return Ok(block);
        }
        let next = d.right_link(block)?;
        if next == INVALID_BLOCK {
            return Ok(block);
        }
        block = next;
    }
}

/// Lock-coupled descent to the leaf covering `key` (spec.md §4.3
/// "Descent"). Returns the leaf block and the stack of internal ancestors
/// visited, root-to-just-above-leaf order.
pub fn find_leaf<D: Dispatch>(d: &D, key: &D::Key) -> Result<(u32, Vec<u32>)> {
    let mut block = recover_right(d, d.root(), key)?;
    let mut stack = Vec::new();
    while !d.is_leaf(block)? {
        stack.push(block);
        let child = d.find_child(block, key)?;
        block = recover_right(d, child, key)?;
    }
    Ok((block, stack))
}

/// Structural insert (spec.md §4.3 "Insertion"): place if it fits, else
/// split and propagate a downlink upward, rebuilding the ancestor stack
/// via `find_leaf` if a concurrent parent split makes the cached stack
/// stale (the "`find_parents`" fallback).
pub fn insert_value<D: Dispatch>(d: &D, key: &D::Key, item: D::Item) -> Result<()> {
    let (leaf, stack) = find_leaf(d, key)?;
    insert_at(d, key, leaf, stack, item)
}

fn insert_at<D: Dispatch>(d: &D, key: &D::Key, mut block: u32, mut stack: Vec<u32>, item: D::Item) -> Result<()> {
    let mut pending = item;
    loop {
        block = recover_right(d, block, key)?;
        if d.fits(block, &pending)? {
            d.place(block, pending)?;
            return Ok(());
        }

        let left_target = match stack.last() {
            Some(_) => block,
            None => d.new_block()?,
        };
        let (right_block, right_key) = d.split(block, pending, left_target)?;

        match stack.pop() {
            None => {
                d.fill_root(block, left_target, right_block, right_key)?;
                return Ok(());
            }
            Some(mut parent) => {
                if d.find_child_ptr(parent, left_target).is_err() {
                    log::debug!("lost parent link for block {}, rebuilding stack via find_parents", left_target);
                    let (_, rebuilt) = find_leaf(d, key)?;
                    stack = rebuilt;
                    parent = stack.pop().ok_or_else(|| Error::invariant("find_parents found no ancestors"))?;
                }
                pending = d.downlink_item(right_block, right_key);
                block = parent;
            }
        }
    }
}
