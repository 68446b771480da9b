//! The crate's single entry point (spec.md §6 "External interfaces"):
//! wires the entry tree, posting trees, scan driver and vacuum pass
//! behind one handle, staging every structural change through the WAL
//! before it is applied to the page cache.
//!
//! `Index::open` does not reload cold pages from the backing file (see
//! `store.rs`'s documented limitation) — instead it rebuilds the whole
//! in-memory tree by replaying the WAL's `Insert` records against a fresh
//! store image, the way a from-scratch WAL-driven recovery would. A host
//! with a real buffer manager would instead reload pages lazily and use
//! the WAL only for the tail since the last checkpoint.

use std::sync::Arc;

use crate::accum::Accumulator;
use crate::codec::AttrDescriptor;
use crate::config::Config;
use crate::entry_tree;
use crate::error::{Error, Result};
use crate::model::{Aux, Category, HeapPtr, Key, Posting};
use crate::opclass::{IsDead, OpClass};
use crate::page::{ListPage, INVALID_BLOCK};
use crate::scan::{fast::FastScan, FullScan, Scan};
use crate::store::{self, Meta, PageBody, PageStore};
use crate::vacuum::{self, VacuumStats};
use crate::wal::{Record, Wal};

pub struct Index {
    store: Arc<PageStore>,
    opclass: Arc<dyn OpClass>,
    cfg: Config,
    wal: Wal,
}

impl Index {
    /// Create a brand-new, empty index backed by `cfg.dir`.
    pub fn create(cfg: Config, opclass: Arc<dyn OpClass>) -> Result<Index> {
        cfg.validate()?;
        log::debug!("creating index {:?}/{}", cfg.dir, cfg.name);
        let store = Arc::new(PageStore::create(cfg.clone())?);
        let wal = Wal::create(&cfg.dir, &cfg.name)?;
        wal.append(&Record::CreateIndex { name: cfg.name.clone() })?;
        Ok(Index { store, opclass, cfg, wal })
    }

    /// Reopen an existing index, replaying its WAL to reconstruct the
    /// entry tree (see module doc for the recovery model this build uses).
    pub fn open(cfg: Config, opclass: Arc<dyn OpClass>) -> Result<Index> {
        cfg.validate()?;
        let store = Arc::new(PageStore::create(cfg.clone())?);
        let wal = Wal::open(&cfg.dir, &cfg.name)?;
        let index = Index { store, opclass, cfg, wal };
        index.replay()?;
        Ok(index)
    }

    fn replay(&self) -> Result<()> {
        let records = self.wal.replay()?;
        log::debug!("replaying {} wal record(s) for {}", records.len(), self.cfg.name);
        for record in records {
            if let Record::Insert { payload, .. } = record {
                let (key, posting) = decode_insert_payload(&payload)?;
                entry_tree::insert(&self.store, &self.opclass, &self.cfg, key, vec![posting])?;
            }
        }
        Ok(())
    }

    /// Index one row's value for `attr`, extracting zero or more `(key,
    /// aux)` entries via the opclass and merging each into the entry tree
    /// (spec.md §4.4). The common, non-bulk insertion path.
    pub fn insert(&self, ptr: HeapPtr, attr: u16, value: &[u8]) -> Result<()> {
        let mut acc = Accumulator::new();
        for extracted in self.opclass.extract_value(attr, value)? {
            acc.push(extracted.key, Posting::new(ptr, extracted.aux));
        }
        self.apply(acc)
    }

    /// Index many rows at once, deduping per key across the whole batch
    /// before touching the tree (spec.md §9 "Arena + indices" design note).
    pub fn insert_bulk(&self, rows: &[(HeapPtr, u16, Vec<u8>)]) -> Result<()> {
        let mut acc = Accumulator::new();
        for (ptr, attr, value) in rows {
            for extracted in self.opclass.extract_value(*attr, value)? {
                acc.push(extracted.key, Posting::new(*ptr, extracted.aux));
            }
        }
        self.apply(acc)
    }

    fn apply(&self, acc: Accumulator) -> Result<()> {
        if acc.is_empty() {
            return Ok(());
        }
        for (key, postings) in acc.finish(self.opclass.as_ref()) {
            for posting in &postings {
                self.wal.append(&Record::Insert {
                    block: 0,
                    payload: encode_insert_payload(&key, posting),
                })?;
            }
            entry_tree::insert(&self.store, &self.opclass, &self.cfg, key, postings)?;
        }
        Ok(())
    }

    /// Append one row's extracted entries to the pending-list chain
    /// instead of merging them into the entry tree directly (spec.md §4.9,
    /// `use_fast_update`). The caller is responsible for eventually calling
    /// `flush_pending`; this crate does not schedule that itself.
    pub fn list_page_append(&self, ptr: HeapPtr, attr: u16, value: &[u8]) -> Result<()> {
        let entries = self.opclass.extract_value(attr, value)?;
        if entries.is_empty() {
            return Ok(());
        }
        let tuples: Vec<(Key, Posting)> = entries.into_iter().map(|e| (e.key, Posting::new(ptr, e.aux))).collect();
        let desc = AttrDescriptor::varlena();

        let tail = self.meta(|m| m.tail)?;
        let mut block = if tail == INVALID_BLOCK { self.new_list_page(None)? } else { tail };

        let full = {
            let page = self.store.fetch(block)?;
            let mut body = page.body.write().unwrap();
            match &mut *body {
                PageBody::List(lp) => {
                    lp.tuples.extend(tuples.iter().cloned());
                    lp.encoded_size(&desc) > self.cfg.blk_sz - crate::config::OPAQUE_TAIL_SIZE
                }
                _ => return Err(Error::invariant("pending-list tail block is not a list page")),
            }
        };
        // Next append starts a fresh page once this one is full, chained
        // via right_link so `flush_pending` can walk the whole run.
        if full {
            block = self.new_list_page(Some(block))?;
        }

        self.update_meta(|m| m.n_pending_tuples += tuples.len() as u64)?;
        self.wal.append(&Record::InsertListPage { block, full_row: false })?;
        Ok(())
    }

    /// Allocate a new, empty pending-list page, linking it after `prev`
    /// (if any) and updating the meta page's head/tail bookkeeping.
    fn new_list_page(&self, prev: Option<u32>) -> Result<u32> {
        let block = self.store.extend()?;
        self.store.store(block, PageBody::List(ListPage::empty()))?;
        if let Some(prev) = prev {
            let page = self.store.fetch(prev)?;
            let mut body = page.body.write().unwrap();
            match &mut *body {
                PageBody::List(lp) => lp.opaque.right_link = block,
                _ => return Err(Error::invariant("pending-list page is not a list page")),
            }
        }
        self.update_meta(|m| {
            if prev.is_none() {
                m.head = block;
            }
            m.tail = block;
            m.n_pending_pages += 1;
        })?;
        Ok(block)
    }

    /// Drain the whole pending-list chain into the entry tree and free it
    /// (spec.md §4.9). The flush *policy* (when to call this) is the
    /// upstream collaborator's responsibility, not this crate's.
    pub fn flush_pending(&self) -> Result<()> {
        let head = self.meta(|m| m.head)?;
        if head == INVALID_BLOCK {
            return Ok(());
        }

        let mut acc = Accumulator::new();
        let mut block = head;
        loop {
            let page = self.store.fetch(block)?;
            let body = page.body.read().unwrap();
            let lp = match &*body {
                PageBody::List(p) => p,
                _ => return Err(Error::invariant("pending-list chain block is not a list page")),
            };
            for (key, posting) in &lp.tuples {
                acc.push(key.clone(), posting.clone());
            }
            let next = lp.opaque.right_link;
            drop(body);
            if next == INVALID_BLOCK {
                break;
            }
            block = next;
        }
        let tail = block;

        for (key, postings) in acc.finish(self.opclass.as_ref()) {
            entry_tree::insert(&self.store, &self.opclass, &self.cfg, key, postings)?;
        }

        self.wal.append(&Record::DeleteListPages { head, tail })?;
        self.update_meta(|m| {
            m.head = INVALID_BLOCK;
            m.tail = INVALID_BLOCK;
            m.n_pending_pages = 0;
            m.n_pending_tuples = 0;
        })?;
        Ok(())
    }

    fn meta<R>(&self, f: impl FnOnce(&Meta) -> R) -> Result<R> {
        let page = self.store.fetch(store::META_BLOCK)?;
        let body = page.body.read().unwrap();
        match &*body {
            PageBody::Meta(m) => Ok(f(m)),
            _ => Err(Error::invariant("block 0 is not the meta page")),
        }
    }

    fn update_meta(&self, f: impl FnOnce(&mut Meta)) -> Result<()> {
        let page = self.store.fetch(store::META_BLOCK)?;
        let mut body = page.body.write().unwrap();
        match &mut *body {
            PageBody::Meta(m) => {
                f(m);
                Ok(())
            }
            _ => Err(Error::invariant("block 0 is not the meta page")),
        }
    }

    /// Regular (AND, merge-join) scan over `attr` for `query` (spec.md
    /// §4.7 "Regular scan").
    pub fn scan(&self, attr: u16, query: &[u8]) -> Result<Scan> {
        Scan::new(&self.store, &self.opclass, &self.cfg, attr, query)
    }

    /// Fast scan: same compiled keys, pruned with `pre_consistent`
    /// (spec.md §4.7 "Fast scan").
    pub fn scan_fast(&self, attr: u16, query: &[u8]) -> Result<FastScan> {
        FastScan::new(&self.store, &self.opclass, &self.cfg, attr, query)
    }

    /// Full scan, ranked by `opclass.ordering` (spec.md §4.7 "Full scan").
    pub fn full_scan(&self, attr: u16) -> Result<FullScan> {
        FullScan::new(&self.store, &self.opclass, &self.cfg, attr)
    }

    /// Runs fast scan when the opclass declares `can_pre_consistent`,
    /// falling back to the regular merge-join otherwise (spec.md §4.7:
    /// fast scan is strictly an optimization over the regular scan, never
    /// a behavior change).
    pub fn scan_auto(&self, attr: u16, query: &[u8]) -> Result<Box<dyn Iterator<Item = Result<(HeapPtr, bool)>>>> {
        if self.opclass.capabilities(attr).can_pre_consistent {
            Ok(Box::new(self.scan_fast(attr, query)?))
        } else {
            Ok(Box::new(self.scan(attr, query)?))
        }
    }

    /// Run one vacuum pass against `is_dead` (spec.md §4.6).
    pub fn vacuum(&self, is_dead: &dyn IsDead) -> Result<VacuumStats> {
        vacuum::vacuum(&self.store, &self.opclass, &self.cfg, is_dead)
    }

    /// Coarse whole-store flush; see `store::PageStore::flush_all`.
    pub fn flush(&self) -> Result<()> {
        self.store.flush_all()
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }
}

fn encode_insert_payload(key: &Key, posting: &Posting) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&key.attr.to_le_bytes());
    out.push(key.category.as_i8() as u8);
    out.extend_from_slice(&(key.datum.len() as u32).to_le_bytes());
    out.extend_from_slice(&key.datum);
    out.extend_from_slice(&posting.ptr.block.to_le_bytes());
    out.extend_from_slice(&posting.ptr.offset.to_le_bytes());
    match posting.aux.bytes() {
        Some(bytes) => {
            out.push(1);
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(bytes);
        }
        None => out.push(0),
    }
    out
}

fn decode_insert_payload(bytes: &[u8]) -> Result<(Key, Posting)> {
    let mut cursor = 0usize;
    let attr = read_u16(bytes, &mut cursor)?;
    let category_byte = *bytes.get(cursor).ok_or_else(|| Error::invariant("truncated insert payload"))?;
    let category = Category::from_i8(category_byte as i8).ok_or_else(|| Error::invariant("bad category byte in insert payload"))?;
    cursor += 1;
    let datum_len = read_u32(bytes, &mut cursor)? as usize;
    let datum = bytes
        .get(cursor..cursor + datum_len)
        .ok_or_else(|| Error::invariant("truncated insert payload"))?
        .to_vec()
        .into_boxed_slice();
    cursor += datum_len;
    let block = read_u32(bytes, &mut cursor)?;
    let offset = read_u16(bytes, &mut cursor)?;
    let has_aux = *bytes.get(cursor).ok_or_else(|| Error::invariant("truncated insert payload"))?;
    cursor += 1;
    let aux = if has_aux != 0 {
        let len = read_u32(bytes, &mut cursor)? as usize;
        let b = bytes
            .get(cursor..cursor + len)
            .ok_or_else(|| Error::invariant("truncated insert payload"))?
            .to_vec()
            .into_boxed_slice();
        Aux(Some(b))
    } else {
        Aux::none()
    };
    let key = Key { attr, category, datum };
    Ok((key, Posting::new(HeapPtr::new(block, offset), aux)))
}

fn read_u16(bytes: &[u8], cursor: &mut usize) -> Result<u16> {
    let end = *cursor + 2;
    let slice = bytes.get(*cursor..end).ok_or_else(|| Error::invariant("truncated insert payload"))?;
    *cursor = end;
    Ok(u16::from_le_bytes(slice.try_into().unwrap()))
}

fn read_u32(bytes: &[u8], cursor: &mut usize) -> Result<u32> {
    let end = *cursor + 4;
    let slice = bytes.get(*cursor..end).ok_or_else(|| Error::invariant("truncated insert payload"))?;
    *cursor = end;
    Ok(u32::from_le_bytes(slice.try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opclass::{ExtractedEntry, MatchState, OpClassCapabilities, QueryEntry};
    use std::cmp::Ordering;

    struct BytesOpClass;

    impl OpClass for BytesOpClass {
        fn extract_value(&self, attr: u16, value: &[u8]) -> Result<Vec<ExtractedEntry>> {
            Ok(vec![ExtractedEntry {
                key: Key::norm(attr, Box::from(value)),
                aux: Aux::none(),
            }])
        }
        fn extract_query(&self, attr: u16, query: &[u8]) -> Result<Vec<QueryEntry>> {
            Ok(vec![QueryEntry {
                key: Key::norm(attr, Box::from(query)),
                is_partial: false,
                predicted_count: None,
            }])
        }
        fn compare(&self, _attr: u16, a: &[u8], b: &[u8]) -> Ordering {
            a.cmp(b)
        }
        fn consistent(&self, _attr: u16, _query_key: &[u8], _category: Category, state: &MatchState) -> Result<bool> {
            Ok(state.matches.iter().all(|&m| m))
        }
        fn capabilities(&self, _attr: u16) -> OpClassCapabilities {
            OpClassCapabilities::default()
        }
    }

    fn test_cfg(name: &str) -> Config {
        let mut dir = std::env::temp_dir();
        dir.push("rum-test-index");
        let mut cfg = Config::new(dir.to_str().unwrap(), name);
        cfg.blk_sz = 512;
        cfg
    }

    #[test]
    fn insert_then_scan_finds_the_row() {
        let cfg = test_cfg("insert-scan");
        let index = Index::create(cfg, Arc::new(BytesOpClass)).unwrap();
        index.insert(HeapPtr::new(1, 1), 1, b"hello").unwrap();
        index.insert(HeapPtr::new(1, 2), 1, b"world").unwrap();

        let mut scan = index.scan(1, b"hello").unwrap();
        assert_eq!(scan.advance().unwrap(), Some((HeapPtr::new(1, 1), false)));
        assert_eq!(scan.advance().unwrap(), None);
    }

    #[test]
    fn reopen_replays_wal_into_the_same_entries() {
        let cfg = test_cfg("reopen");
        {
            let index = Index::create(cfg.clone(), Arc::new(BytesOpClass)).unwrap();
            index.insert(HeapPtr::new(1, 1), 1, b"hello").unwrap();
        }
        let reopened = Index::open(cfg, Arc::new(BytesOpClass)).unwrap();
        let mut scan = reopened.scan(1, b"hello").unwrap();
        assert_eq!(scan.advance().unwrap(), Some((HeapPtr::new(1, 1), false)));
    }

    #[test]
    fn pending_list_append_then_flush_surfaces_the_row() {
        let cfg = test_cfg("pending");
        let index = Index::create(cfg, Arc::new(BytesOpClass)).unwrap();
        index.list_page_append(HeapPtr::new(1, 1), 1, b"hello").unwrap();
        assert!(index.scan(1, b"hello").unwrap().advance().unwrap().is_none());

        index.flush_pending().unwrap();
        let mut scan = index.scan(1, b"hello").unwrap();
        assert_eq!(scan.advance().unwrap(), Some((HeapPtr::new(1, 1), false)));
    }

    #[test]
    fn vacuum_drops_dead_rows_inserted_through_the_index() {
        let cfg = test_cfg("vacuum");
        let index = Index::create(cfg, Arc::new(BytesOpClass)).unwrap();
        index.insert(HeapPtr::new(1, 1), 1, b"hello").unwrap();

        struct AllDead;
        impl IsDead for AllDead {
            fn is_dead(&self, _ptr: HeapPtr) -> bool {
                true
            }
        }
        let stats = index.vacuum(&AllDead).unwrap();
        assert_eq!(stats.postings_dropped, 1);
        assert!(index.scan(1, b"hello").unwrap().advance().unwrap().is_none());
    }
}
