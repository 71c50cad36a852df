use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{MnemoError, Result};

/// Geometry and location of one layer's datastore.
///
/// One `StoreConfig` describes one set of backing files: keys/values
/// shaped `(n_heads, capacity, dimension)` plus token/id side-channels
/// shaped `(capacity)`, all under `directory`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    /// Directory holding the backing files for this store.
    pub directory: PathBuf,
    /// Model identifier baked into file names so stores from different
    /// hosts never collide.
    pub model_type: String,
    /// Maximum number of entries the store can hold.
    pub capacity: usize,
    /// Per-head key/value dimensionality.
    pub dimension: usize,
    /// Number of attention heads sharing this store.
    pub n_heads: usize,
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.model_type.is_empty() {
            return Err(MnemoError::Config("model_type must not be empty".to_string()));
        }
        if self.capacity == 0 {
            return Err(MnemoError::Config("capacity must be > 0".to_string()));
        }
        if self.dimension == 0 {
            return Err(MnemoError::Config("dimension must be > 0".to_string()));
        }
        if self.n_heads == 0 {
            return Err(MnemoError::Config("n_heads must be > 0".to_string()));
        }
        Ok(())
    }
}

/// ANN index flavor built over a store's keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexFlavor {
    /// Exact inner-product scan. No training step.
    Flat,
    /// Inverted-file index: k-means coarse quantizer, `nprobe` cells
    /// probed per query. Requires training on the stored keys.
    Ivf { nlist: usize, nprobe: usize },
}

/// Retrieval policy for one engine.
#[derive(Clone, Debug)]
pub struct RetrievalConfig {
    /// Neighbors fetched per query (and span cap for by-id lookups).
    pub topk: usize,
    /// Fetch whole example spans by id instead of similarity search
    /// during single-token decoding.
    pub by_ids: bool,
    /// Decode steps at the start of generation during which retrieval
    /// is suppressed entirely.
    pub skip_retrieval_steps: usize,
    /// Drop the first slot of every by-id span (conventionally the
    /// start-of-sequence token).
    pub skip_first_token: bool,
    /// Splice retrieved entries after the first local position instead
    /// of in front of the whole local context.
    pub add_after_first: bool,
    /// Allow similarity retrieval when a call covers more than one
    /// token per example. Off by default: full-sequence evaluation is
    /// retrieval-disabled to bound memory.
    pub multi_token_retrieval: bool,
    /// Index flavor used by `build_index`.
    pub flavor: IndexFlavor,
    /// Entries inserted per chunk during index build.
    pub index_build_batch: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            topk: 1024,
            by_ids: false,
            skip_retrieval_steps: 0,
            skip_first_token: false,
            add_after_first: false,
            multi_token_retrieval: false,
            flavor: IndexFlavor::Flat,
            index_build_batch: 1_000_000,
        }
    }
}

impl RetrievalConfig {
    pub fn validate(&self) -> Result<()> {
        if self.index_build_batch == 0 {
            return Err(MnemoError::Config(
                "index_build_batch must be > 0".to_string(),
            ));
        }
        if let IndexFlavor::Ivf { nlist, nprobe } = self.flavor {
            if nlist == 0 {
                return Err(MnemoError::Config("ivf nlist must be > 0".to_string()));
            }
            if nprobe == 0 {
                return Err(MnemoError::Config("ivf nprobe must be > 0".to_string()));
            }
        }
        Ok(())
    }
}
