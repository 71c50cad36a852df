//! Approximate-nearest-neighbor indexes over a store's keys.
//!
//! One index per (layer, head). Built once from a frozen store,
//! persisted, then loaded immutable for querying. Inner product is the
//! similarity measure throughout: higher scores are better matches.

mod flat;
mod format;
mod ivf;
pub mod ragged;

pub use flat::FlatIndex;
pub use ivf::IvfIndex;
pub use ragged::RaggedIndex;

use std::path::Path;

use crate::config::IndexFlavor;
use crate::error::{MnemoError, Result};

/// A hit returned by [`AnnIndex::search`]: the store offset of the
/// matched entry and its inner-product score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    pub offset: usize,
    pub score: f32,
}

/// An immutable ANN index for one attention head.
#[derive(Debug)]
pub enum AnnIndex {
    Flat(FlatIndex),
    Ivf(IvfIndex),
}

impl AnnIndex {
    /// Entries indexed.
    pub fn len(&self) -> usize {
        match self {
            AnnIndex::Flat(ix) => ix.len(),
            AnnIndex::Ivf(ix) => ix.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dim(&self) -> usize {
        match self {
            AnnIndex::Flat(ix) => ix.dim(),
            AnnIndex::Ivf(ix) => ix.dim(),
        }
    }

    /// Top-k inner-product search for a single query vector, best
    /// score first. May return fewer than `topk` hits when the index
    /// holds fewer entries.
    pub fn search(&self, query: &[f32], topk: usize) -> Vec<SearchHit> {
        match self {
            AnnIndex::Flat(ix) => ix.search(query, topk),
            AnnIndex::Ivf(ix) => ix.search(query, topk),
        }
    }

    /// Persist to `path`, overwriting any previous blob. Rebuilding
    /// from identical keys produces an identical file.
    pub fn save(&self, path: &Path) -> Result<()> {
        format::save(self, path)
    }

    /// Load a previously persisted index.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(MnemoError::IndexNotFound(path.to_path_buf()));
        }
        format::load(path)
    }
}

/// Incremental builder driven by the store in `batch_size` chunks.
///
/// IVF requires a training pass over the full key set before any
/// entries are added; the flat flavor ignores `train`.
#[derive(Debug)]
pub struct AnnIndexBuilder {
    inner: BuilderInner,
}

#[derive(Debug)]
enum BuilderInner {
    Flat(FlatIndex),
    Ivf(IvfIndex),
}

impl AnnIndexBuilder {
    pub fn new(flavor: IndexFlavor, dim: usize) -> Self {
        let inner = match flavor {
            IndexFlavor::Flat => BuilderInner::Flat(FlatIndex::new(dim)),
            IndexFlavor::Ivf { nlist, nprobe } => BuilderInner::Ivf(IvfIndex::new(dim, nlist, nprobe)),
        };
        Self { inner }
    }

    /// Whether this flavor needs a training pass before insertion.
    pub fn needs_training(&self) -> bool {
        matches!(self.inner, BuilderInner::Ivf(_))
    }

    /// Train on the full key set, `count` rows of `dim` floats.
    pub fn train(&mut self, keys: &[f32], count: usize) -> Result<()> {
        match &mut self.inner {
            BuilderInner::Flat(_) => Ok(()),
            BuilderInner::Ivf(ix) => ix.train(keys, count),
        }
    }

    /// Insert `count` rows whose store offsets start at `base_offset`.
    pub fn add(&mut self, keys: &[f32], count: usize, base_offset: usize) -> Result<()> {
        match &mut self.inner {
            BuilderInner::Flat(ix) => ix.add(keys, count, base_offset),
            BuilderInner::Ivf(ix) => ix.add(keys, count, base_offset),
        }
    }

    pub fn finish(self) -> AnnIndex {
        match self.inner {
            BuilderInner::Flat(ix) => AnnIndex::Flat(ix),
            BuilderInner::Ivf(ix) => AnnIndex::Ivf(ix),
        }
    }
}

pub(crate) fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_roundtrips_flavors() {
        let keys = vec![1.0, 0.0, 0.0, 1.0];
        let mut b = AnnIndexBuilder::new(IndexFlavor::Flat, 2);
        assert!(!b.needs_training());
        b.add(&keys, 2, 0).unwrap();
        let ix = b.finish();
        assert_eq!(ix.len(), 2);
        assert_eq!(ix.dim(), 2);

        let mut b = AnnIndexBuilder::new(IndexFlavor::Ivf { nlist: 2, nprobe: 2 }, 2);
        assert!(b.needs_training());
        b.train(&keys, 2).unwrap();
        b.add(&keys, 2, 0).unwrap();
        assert_eq!(b.finish().len(), 2);
    }
}
