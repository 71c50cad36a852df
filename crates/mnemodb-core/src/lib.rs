//! MnemoDB: a disk-backed associative memory for retrieval-augmented
//! attention.
//!
//! Per attention layer, a memory-mapped [`store::VectorStore`] holds
//! per-head key/value vectors with token/id side-channels; ANN indexes
//! and a by-example-id span table are built over it; a
//! [`engine::RetrievalEngine`] orchestrates the save and retrieve
//! stages; and [`attention::AttentionFusion`] blends retrieved entries
//! into the host's attention computation.

pub mod attention;
pub mod config;
pub mod engine;
pub mod error;
pub mod index;
pub mod store;
pub mod tensor;
pub mod tracker;

pub use crate::attention::{AttentionFusion, AttentionOutput, FusionConfig, NoPositionBias, PositionBias};
pub use crate::config::{IndexFlavor, RetrievalConfig, StoreConfig};
pub use crate::engine::{
    AttentionAugmentation, AugmentableModel, RetrievalCoordinator, RetrievalEngine,
    RetrievalSession, Stage,
};
pub use crate::error::{MnemoError, Result};
pub use crate::index::{AnnIndex, AnnIndexBuilder, RaggedIndex, SearchHit};
pub use crate::store::VectorStore;
pub use crate::tensor::{AttnBatch, HeadVectors, RetrievedBatch};
pub use crate::tracker::RetrievalTracker;
