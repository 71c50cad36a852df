//! Inverted-file index: k-means coarse quantizer over the stored keys,
//! posting lists per cell, `nprobe` cells scanned per query.
//!
//! Cell assignment uses squared L2 distance to the centroids; scoring
//! within probed cells uses the inner product, matching the flat
//! flavor.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::{MnemoError, Result};
use crate::index::{inner_product, SearchHit};

#[derive(Debug, Clone, PartialEq)]
pub struct IvfIndex {
    dim: usize,
    nlist: usize,
    nprobe: usize,
    /// Row-major `(nlist, dim)` centroids; empty until trained.
    centroids: Vec<f32>,
    /// One posting list per cell: (store offset, key vector) pairs.
    lists: Vec<Vec<PostingEntry>>,
    count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PostingEntry {
    pub(crate) offset: usize,
    pub(crate) vector: Vec<f32>,
}

const KMEANS_MAX_ITERS: usize = 25;

impl IvfIndex {
    pub fn new(dim: usize, nlist: usize, nprobe: usize) -> Self {
        Self {
            dim,
            nlist,
            nprobe,
            centroids: Vec::new(),
            lists: Vec::new(),
            count: 0,
        }
    }

    pub(crate) fn from_parts(
        dim: usize,
        nlist: usize,
        nprobe: usize,
        centroids: Vec<f32>,
        lists: Vec<Vec<PostingEntry>>,
    ) -> Self {
        let count = lists.iter().map(Vec::len).sum();
        Self {
            dim,
            nlist,
            nprobe,
            centroids,
            lists,
            count,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub(crate) fn nlist(&self) -> usize {
        self.nlist
    }

    pub(crate) fn nprobe(&self) -> usize {
        self.nprobe
    }

    pub(crate) fn centroids(&self) -> &[f32] {
        &self.centroids
    }

    pub(crate) fn lists(&self) -> &[Vec<PostingEntry>] {
        &self.lists
    }

    pub fn is_trained(&self) -> bool {
        !self.centroids.is_empty()
    }

    /// K-means over the full key set, `count` rows of `dim` floats.
    pub fn train(&mut self, keys: &[f32], count: usize) -> Result<()> {
        if keys.len() != count * self.dim {
            return Err(MnemoError::Config(format!(
                "ivf train: {} floats for {count} rows of dim {}",
                keys.len(),
                self.dim
            )));
        }
        if count == 0 {
            return Err(MnemoError::Config(
                "ivf train: cannot train on an empty key set".to_string(),
            ));
        }
        let actual_k = self.nlist.min(count);
        self.centroids = kmeans(keys, count, self.dim, actual_k, KMEANS_MAX_ITERS);
        self.nlist = actual_k;
        self.lists = vec![Vec::new(); actual_k];
        Ok(())
    }

    pub fn add(&mut self, keys: &[f32], count: usize, base_offset: usize) -> Result<()> {
        if !self.is_trained() {
            return Err(MnemoError::Config(
                "ivf add: index must be trained first".to_string(),
            ));
        }
        if keys.len() != count * self.dim {
            return Err(MnemoError::Config(format!(
                "ivf add: {} floats for {count} rows of dim {}",
                keys.len(),
                self.dim
            )));
        }
        for i in 0..count {
            let vector = keys[i * self.dim..(i + 1) * self.dim].to_vec();
            let cell = self.nearest_centroid(&vector);
            self.lists[cell].push(PostingEntry {
                offset: base_offset + i,
                vector,
            });
            self.count += 1;
        }
        Ok(())
    }

    pub fn search(&self, query: &[f32], topk: usize) -> Vec<SearchHit> {
        if topk == 0 || self.count == 0 || !self.is_trained() {
            return Vec::new();
        }

        let nprobe = self.nprobe.min(self.nlist);
        let mut cells: Vec<(usize, f32)> = (0..self.nlist)
            .map(|c| (c, l2_sq(query, &self.centroids[c * self.dim..(c + 1) * self.dim])))
            .collect();
        cells.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));

        let mut heap: BinaryHeap<WorstFirst> = BinaryHeap::with_capacity(topk);
        for &(cell, _) in cells.iter().take(nprobe) {
            for entry in &self.lists[cell] {
                let score = inner_product(query, &entry.vector);
                if heap.len() < topk {
                    heap.push(WorstFirst(SearchHit {
                        offset: entry.offset,
                        score,
                    }));
                } else if let Some(worst) = heap.peek() {
                    if score > worst.0.score {
                        heap.pop();
                        heap.push(WorstFirst(SearchHit {
                            offset: entry.offset,
                            score,
                        }));
                    }
                }
            }
        }

        let mut hits: Vec<SearchHit> = heap.into_iter().map(|w| w.0).collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        hits
    }

    fn nearest_centroid(&self, vector: &[f32]) -> usize {
        let mut best = 0;
        let mut best_dist = f32::MAX;
        for c in 0..self.nlist {
            let dist = l2_sq(vector, &self.centroids[c * self.dim..(c + 1) * self.dim]);
            if dist < best_dist {
                best_dist = dist;
                best = c;
            }
        }
        best
    }
}

fn l2_sq(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Deterministic k-means: evenly spaced seeds, Lloyd iterations until
/// assignments stop changing.
fn kmeans(data: &[f32], n: usize, dim: usize, k: usize, max_iters: usize) -> Vec<f32> {
    let mut centroids = Vec::with_capacity(k * dim);
    for i in 0..k {
        let seed = i * n / k;
        centroids.extend_from_slice(&data[seed * dim..(seed + 1) * dim]);
    }

    let mut assignments = vec![0usize; n];
    for _ in 0..max_iters {
        let mut changed = false;
        for i in 0..n {
            let point = &data[i * dim..(i + 1) * dim];
            let mut best = 0;
            let mut best_dist = l2_sq(point, &centroids[0..dim]);
            for c in 1..k {
                let dist = l2_sq(point, &centroids[c * dim..(c + 1) * dim]);
                if dist < best_dist {
                    best_dist = dist;
                    best = c;
                }
            }
            if assignments[i] != best {
                assignments[i] = best;
                changed = true;
            }
        }
        if !changed {
            break;
        }

        let mut sums = vec![0.0f32; k * dim];
        let mut counts = vec![0usize; k];
        for i in 0..n {
            let cluster = assignments[i];
            counts[cluster] += 1;
            for j in 0..dim {
                sums[cluster * dim + j] += data[i * dim + j];
            }
        }
        for c in 0..k {
            if counts[c] > 0 {
                for j in 0..dim {
                    centroids[c * dim + j] = sums[c * dim + j] / counts[c] as f32;
                }
            }
        }
    }

    centroids
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
        other
            .0
            .score
            .partial_cmp(&self.0.score)
            .unwrap_or(Ordering::Equal)
    }
}
