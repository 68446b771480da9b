//! Ranked k-way merge (spec.md §5, §9 design note): combines several
//! already-ranked result streams (e.g. one `FullScan` per indexed
//! attribute sharing an ORDER-BY clause) into a single ascending-rank
//! stream, without buffering more than one pending item per stream.
//!
//! Grounded on this codebase's merge-iterator style for combining several
//! sorted sources into one ordered output (the same shape as a k-way
//! merge over sorted runs), adapted here to order by `f64` rank rather
//! than by key.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::Result;
use crate::model::HeapPtr;

type RankedStream = Box<dyn Iterator<Item = Result<(HeapPtr, f64)>> + Send>;

struct RankedItem {
    rank: f64,
    ptr: HeapPtr,
    stream: usize,
}

impl PartialEq for RankedItem {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank
    }
}
impl Eq for RankedItem {}

impl PartialOrd for RankedItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Inverted so `BinaryHeap` (a max-heap) pops the *smallest* rank first.
impl Ord for RankedItem {
    fn cmp(&self, other: &Self) -> Ordering {
        other.rank.partial_cmp(&self.rank).unwrap_or(Ordering::Equal)
    }
}

/// Merges `n` independently-ranked streams into one ascending-rank
/// stream, one pending item per stream at a time.
pub struct RankedMerger {
    streams: Vec<RankedStream>,
    heap: BinaryHeap<RankedItem>,
    failed: bool,
}

impl RankedMerger {
    pub fn new(streams: Vec<RankedStream>) -> Result<RankedMerger> {
        let mut merger = RankedMerger {
            streams,
            heap: BinaryHeap::new(),
            failed: false,
        };
        for i in 0..merger.streams.len() {
            merger.pull(i)?;
        }
        Ok(merger)
    }

    fn pull(&mut self, stream: usize) -> Result<()> {
        if let Some(next) = self.streams[stream].next() {
            let (ptr, rank) = next?;
            self.heap.push(RankedItem { rank, ptr, stream });
        }
        Ok(())
    }

    fn advance(&mut self) -> Result<Option<(HeapPtr, f64)>> {
        if self.failed {
            return Ok(None);
        }
        match self.heap.pop() {
            None => Ok(None),
            Some(item) => {
                if let Err(e) = self.pull(item.stream) {
                    self.failed = true;
                    return Err(e);
                }
                Ok(Some((item.ptr, item.rank)))
            }
        }
    }
}

impl Iterator for RankedMerger {
    type Item = Result<(HeapPtr, f64)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(Some(v)) => Some(Ok(v)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(items: Vec<(u32, f64)>) -> RankedStream {
        Box::new(items.into_iter().map(|(b, r)| Ok((HeapPtr::new(b, 0), r))))
    }

    #[test]
    fn merges_three_ranked_streams_ascending() {
        let merger = RankedMerger::new(vec![
            stream(vec![(1, 0.1), (2, 0.5), (3, 0.9)]),
            stream(vec![(4, 0.2), (5, 0.3)]),
            stream(vec![(6, 0.05), (7, 1.0)]),
        ])
        .unwrap();

        let ranks: Vec<f64> = merger.map(|r| r.unwrap().1).collect();
        let mut sorted = ranks.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(ranks, sorted);
        assert_eq!(ranks.len(), 7);
    }

    #[test]
    fn empty_stream_set_yields_nothing() {
        let merger = RankedMerger::new(Vec::new()).unwrap();
        assert_eq!(merger.count(), 0);
    }
}
