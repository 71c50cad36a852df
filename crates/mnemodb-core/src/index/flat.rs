//! Exact inner-product index: a dense copy of the indexed keys plus
//! their store offsets, scanned in full per query with a bounded heap.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::{MnemoError, Result};
use crate::index::{inner_product, SearchHit};

#[derive(Debug, Clone, PartialEq)]
pub struct FlatIndex {
    dim: usize,
    /// Row-major `(count, dim)` copies of the indexed keys.
    vectors: Vec<f32>,
    /// Store offset of each row.
    offsets: Vec<usize>,
}

impl FlatIndex {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            vectors: Vec::new(),
            offsets: Vec::new(),
        }
    }

    pub(crate) fn from_parts(dim: usize, vectors: Vec<f32>, offsets: Vec<usize>) -> Self {
        Self {
            dim,
            vectors,
            offsets,
        }
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub(crate) fn vectors(&self) -> &[f32] {
        &self.vectors
    }

    pub(crate) fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn add(&mut self, keys: &[f32], count: usize, base_offset: usize) -> Result<()> {
        if keys.len() != count * self.dim {
            return Err(MnemoError::Config(format!(
                "flat index add: {} floats for {count} rows of dim {}",
                keys.len(),
                self.dim
            )));
        }
        self.vectors.extend_from_slice(keys);
        self.offsets.extend((0..count).map(|i| base_offset + i));
        Ok(())
    }

    pub fn search(&self, query: &[f32], topk: usize) -> Vec<SearchHit> {
        if topk == 0 || self.offsets.is_empty() {
            return Vec::new();
        }
        // Min-heap of size topk: the root is the worst of the current
        // best hits, so each better candidate evicts it.
        let mut heap: BinaryHeap<WorstFirst> = BinaryHeap::with_capacity(topk);
        for (row, &offset) in self.offsets.iter().enumerate() {
            let vec = &self.vectors[row * self.dim..(row + 1) * self.dim];
            let score = inner_product(query, vec);
            if heap.len() < topk {
                heap.push(WorstFirst(SearchHit { offset, score }));
            } else if let Some(worst) = heap.peek() {
                if score > worst.0.score {
                    heap.pop();
                    heap.push(WorstFirst(SearchHit { offset, score }));
                }
            }
        }
        let mut hits: Vec<SearchHit> = heap.into_iter().map(|w| w.0).collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        hits
    }
}

/// Heap adapter ordering hits worst-score-first.
#[derive(Debug)]
struct WorstFirst(SearchHit);

impl PartialEq for WorstFirst {
    fn eq(&self, other: &Self) -> bool {
        self.0.score == other.0.score
    }
}

impl Eq for WorstFirst {}

impl PartialOrd for WorstFirst {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WorstFirst {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: lowest score is the heap root.
        other
            .0
            .score
            .partial_cmp(&self.0.score)
            .unwrap_or(Ordering::Equal)
    }
}
