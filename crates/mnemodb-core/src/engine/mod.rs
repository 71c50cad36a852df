//! Save/retrieve orchestration.
//!
//! A `RetrievalEngine` owns one layer's datastore and decides, per
//! call, whether to write new entries (save stage) or fetch matches
//! (retrieve stage) — and in the latter case, whether the step's
//! effective topk is suppressed, served from the by-id cache, gathered
//! by span lookup, or searched through the ANN indexes.

mod session;

pub use session::RetrievalSession;

use std::path::Path;

use crate::config::{RetrievalConfig, StoreConfig};
use crate::error::{MnemoError, Result};
use crate::store::{layout, VectorStore};
use crate::tensor::{AttnBatch, RetrievedBatch};
use crate::tracker::RetrievalTracker;

/// Which half of the lifecycle this engine serves. Fixed at
/// construction; there is no runtime transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Populate the datastore from labeled batches.
    Save,
    /// Query the datastore during generation/evaluation.
    Retrieve,
}

/// The seam a host attention layer calls into. Implemented by
/// [`RetrievalEngine`]; hosts hold it as a capability instead of
/// patching their own forward pass.
pub trait AttentionAugmentation {
    /// Store this batch's key/value projections for the positions the
    /// label mask keeps.
    fn save(
        &mut self,
        session: &mut RetrievalSession,
        keys: &AttnBatch,
        values: &AttnBatch,
        label_mask: &[bool],
        tokens: &[i32],
    ) -> Result<()>;

    /// Fetch this step's retrieved keys/values for `queries`.
    fn retrieve(
        &mut self,
        session: &mut RetrievalSession,
        queries: &AttnBatch,
        key_length: usize,
        decoder_tokens: Option<&[i32]>,
    ) -> Result<RetrievedBatch>;
}

#[derive(Debug)]
pub struct RetrievalEngine {
    store: VectorStore,
    config: RetrievalConfig,
    stage: Stage,
    tracker: Option<RetrievalTracker>,
}

impl RetrievalEngine {
    pub fn new(
        store: VectorStore,
        config: RetrievalConfig,
        stage: Stage,
        tracker: Option<RetrievalTracker>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            stage,
            tracker,
        })
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub fn store(&self) -> &VectorStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut VectorStore {
        &mut self.store
    }

    /// Build and persist ANN indexes for every head of this engine's
    /// store, using the configured flavor and chunk size.
    pub fn build_indexes(&mut self) -> Result<()> {
        let flavor = self.config.flavor;
        let batch = self.config.index_build_batch;
        self.store.build_indexes(flavor, batch)
    }

    /// Flush any buffered tracker output.
    pub fn flush_tracker(&mut self) -> Result<()> {
        match &mut self.tracker {
            Some(t) => t.flush(),
            None => Ok(()),
        }
    }

    /// Effective topk for a step: the configured value, unless this is
    /// a multi-token call without multi-token retrieval enabled, or a
    /// warm-up step.
    fn effective_topk(&self, seq_len: usize, key_length: usize) -> (usize, bool) {
        let mut topk = self.config.topk;
        if seq_len > 1 && !self.config.multi_token_retrieval {
            topk = 0;
        }
        let skipped =
            self.config.skip_retrieval_steps > 0 && key_length <= self.config.skip_retrieval_steps;
        if skipped {
            topk = 0;
        }
        (topk, skipped)
    }
}

impl AttentionAugmentation for RetrievalEngine {
    fn save(
        &mut self,
        session: &mut RetrievalSession,
        keys: &AttnBatch,
        values: &AttnBatch,
        label_mask: &[bool],
        tokens: &[i32],
    ) -> Result<()> {
        if self.stage != Stage::Save {
            return Err(MnemoError::Config(
                "save() called on an engine constructed for the retrieve stage".to_string(),
            ));
        }
        let batch = keys.batch();
        let seq_len = keys.len();
        if values.batch() != batch
            || values.n_heads() != keys.n_heads()
            || values.len() != seq_len
            || values.dim() != keys.dim()
        {
            return Err(MnemoError::Config(
                "value projections shaped differently from key projections".to_string(),
            ));
        }
        let flat_len = batch * seq_len;
        if label_mask.len() != flat_len || tokens.len() != flat_len {
            return Err(MnemoError::Config(format!(
                "label mask ({}) and tokens ({}) must cover batch {batch} x seq {seq_len}",
                label_mask.len(),
                tokens.len()
            )));
        }

        // Positions the host scores; padding and prompt positions are
        // masked out of the datastore.
        let keep: Vec<usize> = (0..flat_len).filter(|&i| label_mask[i]).collect();
        let kept_tokens: Vec<i32> = keep.iter().map(|&i| tokens[i]).collect();
        let kept_ids: Vec<i32> = keep
            .iter()
            .map(|&i| (session.id_offset + i / seq_len) as i32)
            .collect();

        let flat_keys = keys.flatten_positions().select(&keep);
        let flat_values = values.flatten_positions().select(&keep);
        self.store
            .append(&flat_keys, &flat_values, &kept_tokens, &kept_ids)?;

        // Ids track batch position, not surviving-token count, so the
        // offset always advances by the full batch.
        session.id_offset += batch;
        Ok(())
    }

    fn retrieve(
        &mut self,
        session: &mut RetrievalSession,
        queries: &AttnBatch,
        key_length: usize,
        decoder_tokens: Option<&[i32]>,
    ) -> Result<RetrievedBatch> {
        if self.stage != Stage::Retrieve {
            return Err(MnemoError::Config(
                "retrieve() called on an engine constructed for the save stage".to_string(),
            ));
        }
        let batch = queries.batch();
        let seq_len = queries.len();
        let (topk, skipped) = self.effective_topk(seq_len, key_length);
        let want_side = self.tracker.is_some();

        let result = if self.config.by_ids && seq_len == 1 {
            let cached = if skipped { None } else { session.by_id_cache.take() };
            if let Some(hit) = cached {
                let result = hit.clone();
                session.by_id_cache = Some(hit);
                result
            } else {
                let example_ids: Vec<i32> =
                    (0..batch).map(|b| (session.id_offset + b) as i32).collect();
                let fresh = self.store.lookup_by_ids(
                    &example_ids,
                    topk,
                    self.config.skip_first_token,
                    want_side,
                )?;
                // A skipped step must not seed the cache: the first
                // real retrieval step performs a fresh lookup.
                session.by_id_cache = (!skipped).then(|| fresh.clone());
                fresh
            }
        } else {
            self.store
                .query(&queries.flatten_positions(), topk, want_side)?
        };

        if let Some(tracker) = &mut self.tracker {
            if seq_len == 1 {
                let predictions = decoder_tokens.ok_or_else(|| {
                    MnemoError::Config(
                        "tracking single-token steps requires decoder tokens".to_string(),
                    )
                })?;
                tracker.record(
                    predictions,
                    &result.tokens_batch_major(),
                    &result.ids_batch_major(),
                    result.topk(),
                )?;
            } else {
                // Bulk evaluation has no per-step decode loop; whatever
                // was buffered belongs to the previous segment.
                tracker.flush()?;
            }
        }

        if seq_len > 1 {
            // A new evaluation segment starts fresh next call.
            session.id_offset += batch;
            session.by_id_cache = None;
        }

        Ok(result)
    }
}

/// Typed adapter a host model implements so retrieval can be wired to
/// its attention layers at construction time.
pub trait AugmentableModel {
    /// Number of decoder layers; used to resolve negative layer
    /// offsets (`-1` is the last layer).
    fn decoder_layer_count(&self) -> usize;
    /// End-of-sequence token id, used by the tracker.
    fn eos_token_id(&self) -> i32;
}

/// Wires one engine per augmentable layer. The coordinator replaces
/// string-keyed submodule lookup and forward-pass patching: a host
/// resolves its layers once, then routes each layer's attention calls
/// through the matching [`AttentionAugmentation`].
#[derive(Debug)]
pub struct RetrievalCoordinator {
    engines: Vec<(usize, RetrievalEngine)>,
}

impl RetrievalCoordinator {
    /// `layer_offsets` selects which decoder layers get a store;
    /// negative offsets count from the end. Each layer's store lives
    /// under `{base_dir}/layer{idx}` with the geometry of `template`.
    #[allow(clippy::too_many_arguments)]
    pub fn attach(
        model: &dyn AugmentableModel,
        base_dir: &Path,
        template: &StoreConfig,
        layer_offsets: &[isize],
        config: RetrievalConfig,
        stage: Stage,
        track_file: Option<&Path>,
    ) -> Result<Self> {
        config.validate()?;
        let layer_count = model.decoder_layer_count();
        let mut engines = Vec::with_capacity(layer_offsets.len());
        for &offset in layer_offsets {
            let idx = resolve_layer(offset, layer_count)?;
            let store_cfg = StoreConfig {
                directory: layout::layer_directory(base_dir, idx),
                ..template.clone()
            };
            let mut store = VectorStore::open_or_create(store_cfg)?;
            if stage == Stage::Retrieve {
                store.load_indexes()?;
                if config.by_ids {
                    store.build_ragged()?;
                }
            }
            let tracker = match (stage, track_file) {
                (Stage::Retrieve, Some(path)) => Some(RetrievalTracker::open(
                    Some(path),
                    template.n_heads,
                    config.topk,
                    model.eos_token_id(),
                )?),
                _ => None,
            };
            engines.push((idx, RetrievalEngine::new(store, config.clone(), stage, tracker)?));
        }
        Ok(Self { engines })
    }

    /// Resolved layer indices, in attachment order.
    pub fn layers(&self) -> Vec<usize> {
        self.engines.iter().map(|(idx, _)| *idx).collect()
    }

    pub fn engine_mut(&mut self, layer_idx: usize) -> Option<&mut RetrievalEngine> {
        self.engines
            .iter_mut()
            .find(|(idx, _)| *idx == layer_idx)
            .map(|(_, e)| e)
    }

    /// Build and persist ANN indexes for every attached layer.
    pub fn build_indexes(&mut self) -> Result<()> {
        for (_, engine) in &mut self.engines {
            engine.build_indexes()?;
        }
        Ok(())
    }
}

fn resolve_layer(offset: isize, layer_count: usize) -> Result<usize> {
    let idx = if offset < 0 {
        let back = offset.unsigned_abs();
        if back > layer_count {
            return Err(MnemoError::Config(format!(
                "layer offset {offset} out of range for {layer_count} layers"
            )));
        }
        layer_count - back
    } else {
        offset as usize
    };
    if idx >= layer_count {
        return Err(MnemoError::Config(format!(
            "layer offset {offset} out of range for {layer_count} layers"
        )));
    }
    Ok(idx)
}
