//! Per-run mutable retrieval state.
//!
//! Everything the engine mutates across calls lives here and is passed
//! `&mut` into each call: the running example-id counter and the
//! one-slot cache of the last by-id lookup. Two sessions driving the
//! same engine never interfere.

use crate::tensor::RetrievedBatch;

#[derive(Debug, Default)]
pub struct RetrievalSession {
    /// Next example id to assign (save stage) or look up (retrieve
    /// stage). Advances by the batch size at each outer step so ids
    /// stay aligned to batch position across layers.
    pub(crate) id_offset: usize,
    /// Last by-id retrieval result, reused across the single-token
    /// decode steps of one generation call.
    pub(crate) by_id_cache: Option<RetrievedBatch>,
}

impl RetrievalSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Example id the next batch row 0 maps to.
    pub fn id_offset(&self) -> usize {
        self.id_offset
    }

    /// Drop the cached by-id result; the next single-token step
    /// performs a fresh lookup.
    pub fn invalidate_cache(&mut self) {
        self.by_id_cache = None;
    }

    /// Whether a by-id result is cached.
    pub fn has_cached_lookup(&self) -> bool {
        self.by_id_cache.is_some()
    }
}
