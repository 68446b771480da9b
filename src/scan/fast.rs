//! Fast scan (spec.md §4.7 "Fast scan"): the same compiled `ScanKey` set
//! as the regular merge-join, but advances the least-selective key first
//! and uses `pre_consistent` to skip a frontier candidate without paying
//! for a full `consistent` evaluation on every key.

use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::model::HeapPtr;
use crate::opclass::OpClass;
use crate::store::PageStore;

use super::{compile, ScanKey};

/// Pre-consistent-skipping scan driver. Falls back to the same full
/// `consistent` evaluation `Scan` uses once every key's `pre_consistent`
/// check passes for a candidate (spec.md §4.7: `pre_consistent` is only a
/// pruning hint, never authoritative on its own).
pub struct FastScan {
    keys: Vec<ScanKey>,
    opclass: Arc<dyn OpClass>,
    exhausted: bool,
}

impl FastScan {
    pub fn new(store: &Arc<PageStore>, opclass: &Arc<dyn OpClass>, cfg: &Config, attr: u16, query: &[u8]) -> Result<FastScan> {
        let mut keys = compile(store, opclass, cfg, attr, query)?;
        keys.sort_by_key(|k| k.predicted_count.unwrap_or(u64::MAX));
        let exhausted = keys.is_empty();
        Ok(FastScan {
            keys,
            opclass: opclass.clone(),
            exhausted,
        })
    }

    pub fn advance(&mut self) -> Result<Option<(HeapPtr, bool)>> {
        if self.exhausted {
            return Ok(None);
        }
        'candidates: loop {
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

            // Cheapest-first pre_consistent pass: the moment one key's
            // prefix cannot yet be ruled in, seek every lagging entry to
            // the frontier and retry rather than evaluating the rest.
            for key in &self.keys {
                if !key.pre_consistent_at(candidate, self.opclass.as_ref())? {
                    continue 'candidates;
                }
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

impl Iterator for FastScan {
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

#[cfg(test)]
mod tests {
    use std::cmp::Ordering as StdOrdering;
    use std::sync::Arc;

    use super::*;
    use crate::model::{Aux, Category, Key, Posting};
    use crate::opclass::{ExtractedEntry, MatchState, OpClassCapabilities, QueryEntry};
    use crate::store::PageStore;

    /// `extract_query` always yields two fixed keys, "a" and "b", so one
    /// `FastScan::new` call compiles a two-key AND — `a`'s posting tree
    /// carries a long run, `b`'s carries only the tail, which is exactly
    /// spec.md §4.7 scenario 5's shape.
    struct TwoKeyOpClass;

    impl OpClass for TwoKeyOpClass {
        fn extract_value(&self, _attr: u16, _value: &[u8]) -> Result<Vec<ExtractedEntry>> {
            Ok(Vec::new())
        }
        fn extract_query(&self, attr: u16, _query: &[u8]) -> Result<Vec<QueryEntry>> {
            Ok(vec![
                QueryEntry {
                    key: Key::norm(attr, Box::from(&b"a"[..])),
                    is_partial: false,
                    predicted_count: Some(1_000_000),
                },
                QueryEntry {
                    key: Key::norm(attr, Box::from(&b"b"[..])),
                    is_partial: false,
                    predicted_count: Some(2),
                },
            ])
        }
        fn compare(&self, _attr: u16, a: &[u8], b: &[u8]) -> StdOrdering {
            a.cmp(b)
        }
        fn consistent(&self, _attr: u16, _query_key: &[u8], _category: Category, state: &MatchState) -> Result<bool> {
            Ok(state.matches.iter().all(|&m| m))
        }
        fn capabilities(&self, _attr: u16) -> OpClassCapabilities {
            OpClassCapabilities {
                can_pre_consistent: true,
                ..OpClassCapabilities::default()
            }
        }
    }

    fn test_store(name: &str) -> (Arc<PageStore>, Arc<dyn OpClass>, Config) {
        let mut dir = std::env::temp_dir();
        dir.push("rum-test-fast-scan");
        let mut cfg = Config::new(dir.to_str().unwrap(), name);
        cfg.blk_sz = 512; // small page, so "a"'s 2000-item run spans many posting leaves
        let store = Arc::new(PageStore::create(cfg.clone()).unwrap());
        (store, Arc::new(TwoKeyOpClass), cfg)
    }

    #[test]
    fn fast_scan_seeks_past_a_long_run_to_the_matching_tail() {
        let (store, opclass, cfg) = test_store("skip");

        let a_items: Vec<Posting> = (1..=2000u32).map(|i| Posting::new(HeapPtr::new(i, 1), Aux::none())).collect();
        crate::entry_tree::insert(&store, &opclass, &cfg, Key::norm(1, Box::from(&b"a"[..])), a_items).unwrap();

        let b_items = vec![Posting::new(HeapPtr::new(1999, 1), Aux::none()), Posting::new(HeapPtr::new(2000, 1), Aux::none())];
        crate::entry_tree::insert(&store, &opclass, &cfg, Key::norm(1, Box::from(&b"b"[..])), b_items).unwrap();

        let mut scan = FastScan::new(&store, &opclass, &cfg, 1, b"ignored").unwrap();
        let mut found = Vec::new();
        while let Some((ptr, lossy)) = scan.advance().unwrap() {
            assert!(!lossy);
            found.push(ptr);
        }
        assert_eq!(found, vec![HeapPtr::new(1999, 1), HeapPtr::new(2000, 1)]);
    }
}
