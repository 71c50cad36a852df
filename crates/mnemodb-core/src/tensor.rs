//! Flat batch shapes shared by the store, the retrieval engine and the
//! attention fusion path.
//!
//! All buffers are row-major `Vec<f32>`/`Vec<i32>` with the layout
//! spelled out per type; accessors hand out per-row slices so callers
//! never do offset math themselves.

use crate::error::{MnemoError, Result};

/// `(n_heads, len, dim)` f32 slab: one row of `dim` floats per
/// (head, position). This is the wire shape for store appends and
/// similarity queries.
#[derive(Debug, Clone, PartialEq)]
pub struct HeadVectors {
    n_heads: usize,
    len: usize,
    dim: usize,
    data: Vec<f32>,
}

impl HeadVectors {
    /// Zero-filled slab.
    pub fn zeros(n_heads: usize, len: usize, dim: usize) -> Self {
        Self {
            n_heads,
            len,
            dim,
            data: vec![0.0; n_heads * len * dim],
        }
    }

    /// Wrap an existing buffer; the length must match the shape product.
    pub fn from_vec(n_heads: usize, len: usize, dim: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != n_heads * len * dim {
            return Err(MnemoError::Config(format!(
                "head vectors buffer has {} elements, shape ({n_heads}, {len}, {dim}) needs {}",
                data.len(),
                n_heads * len * dim
            )));
        }
        Ok(Self {
            n_heads,
            len,
            dim,
            data,
        })
    }

    pub fn n_heads(&self) -> usize {
        self.n_heads
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn row(&self, head: usize, i: usize) -> &[f32] {
        let offset = (head * self.len + i) * self.dim;
        &self.data[offset..offset + self.dim]
    }

    pub fn row_mut(&mut self, head: usize, i: usize) -> &mut [f32] {
        let offset = (head * self.len + i) * self.dim;
        &mut self.data[offset..offset + self.dim]
    }

    /// Select a subset of positions, preserving order: output row `j`
    /// of every head is input row `keep[j]`.
    pub fn select(&self, keep: &[usize]) -> Self {
        let mut out = Self::zeros(self.n_heads, keep.len(), self.dim);
        for h in 0..self.n_heads {
            for (j, &i) in keep.iter().enumerate() {
                out.row_mut(h, j).copy_from_slice(self.row(h, i));
            }
        }
        out
    }
}

/// `(batch, n_heads, len, dim)` f32 slab: the host-side shape for
/// query/key/value projections.
#[derive(Debug, Clone, PartialEq)]
pub struct AttnBatch {
    batch: usize,
    n_heads: usize,
    len: usize,
    dim: usize,
    data: Vec<f32>,
}

impl AttnBatch {
    pub fn zeros(batch: usize, n_heads: usize, len: usize, dim: usize) -> Self {
        Self {
            batch,
            n_heads,
            len,
            dim,
            data: vec![0.0; batch * n_heads * len * dim],
        }
    }

    pub fn from_vec(
        batch: usize,
        n_heads: usize,
        len: usize,
        dim: usize,
        data: Vec<f32>,
    ) -> Result<Self> {
        if data.len() != batch * n_heads * len * dim {
            return Err(MnemoError::Config(format!(
                "attention batch buffer has {} elements, shape ({batch}, {n_heads}, {len}, {dim}) needs {}",
                data.len(),
                batch * n_heads * len * dim
            )));
        }
        Ok(Self {
            batch,
            n_heads,
            len,
            dim,
            data,
        })
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn n_heads(&self) -> usize {
        self.n_heads
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn row(&self, b: usize, head: usize, i: usize) -> &[f32] {
        let offset = ((b * self.n_heads + head) * self.len + i) * self.dim;
        &self.data[offset..offset + self.dim]
    }

    pub fn row_mut(&mut self, b: usize, head: usize, i: usize) -> &mut [f32] {
        let offset = ((b * self.n_heads + head) * self.len + i) * self.dim;
        &mut self.data[offset..offset + self.dim]
    }

    /// Flatten batch and position axes into `(n_heads, batch * len, dim)`,
    /// batch-major within each head.
    pub fn flatten_positions(&self) -> HeadVectors {
        let rows = self.batch * self.len;
        let mut out = HeadVectors::zeros(self.n_heads, rows, self.dim);
        for b in 0..self.batch {
            for h in 0..self.n_heads {
                for i in 0..self.len {
                    out.row_mut(h, b * self.len + i)
                        .copy_from_slice(self.row(b, h, i));
                }
            }
        }
        out
    }
}

/// Top-k retrieval result: keys/values `(n_heads, rows, topk, dim)`
/// plus optional token/id side-channels `(n_heads, rows, topk)`.
///
/// `rows` is `batch * seq_len` for similarity queries and `batch` for
/// by-id lookups. A zero-width result (`topk == 0`) is well-formed and
/// is how disabled retrieval flows through the fusion path.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedBatch {
    n_heads: usize,
    rows: usize,
    topk: usize,
    dim: usize,
    keys: Vec<f32>,
    values: Vec<f32>,
    tokens: Option<Vec<i32>>,
    ids: Option<Vec<i32>>,
}

impl RetrievedBatch {
    /// Zero-filled result of the given width. `with_side_channels`
    /// allocates token/id planes as well.
    pub fn zeros(
        n_heads: usize,
        rows: usize,
        topk: usize,
        dim: usize,
        with_side_channels: bool,
    ) -> Self {
        let plane = n_heads * rows * topk;
        Self {
            n_heads,
            rows,
            topk,
            dim,
            keys: vec![0.0; plane * dim],
            values: vec![0.0; plane * dim],
            tokens: with_side_channels.then(|| vec![0; plane]),
            ids: with_side_channels.then(|| vec![0; plane]),
        }
    }

    /// Zero-width result: the shape callers get when retrieval is
    /// disabled for a step.
    pub fn empty(n_heads: usize, rows: usize, dim: usize, with_side_channels: bool) -> Self {
        Self::zeros(n_heads, rows, 0, dim, with_side_channels)
    }

    pub fn n_heads(&self) -> usize {
        self.n_heads
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn topk(&self) -> usize {
        self.topk
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn has_side_channels(&self) -> bool {
        self.tokens.is_some()
    }

    fn slot(&self, head: usize, row: usize, k: usize) -> usize {
        (head * self.rows + row) * self.topk + k
    }

    pub fn key(&self, head: usize, row: usize, k: usize) -> &[f32] {
        let offset = self.slot(head, row, k) * self.dim;
        &self.keys[offset..offset + self.dim]
    }

    pub fn key_mut(&mut self, head: usize, row: usize, k: usize) -> &mut [f32] {
        let offset = self.slot(head, row, k) * self.dim;
        &mut self.keys[offset..offset + self.dim]
    }

    pub fn value(&self, head: usize, row: usize, k: usize) -> &[f32] {
        let offset = self.slot(head, row, k) * self.dim;
        &self.values[offset..offset + self.dim]
    }

    pub fn value_mut(&mut self, head: usize, row: usize, k: usize) -> &mut [f32] {
        let offset = self.slot(head, row, k) * self.dim;
        &mut self.values[offset..offset + self.dim]
    }

    pub fn token(&self, head: usize, row: usize, k: usize) -> i32 {
        self.tokens.as_ref().map_or(0, |t| t[self.slot(head, row, k)])
    }

    pub fn set_token(&mut self, head: usize, row: usize, k: usize, token: i32) {
        let slot = self.slot(head, row, k);
        if let Some(t) = self.tokens.as_mut() {
            t[slot] = token;
        }
    }

    pub fn id(&self, head: usize, row: usize, k: usize) -> i32 {
        self.ids.as_ref().map_or(0, |t| t[self.slot(head, row, k)])
    }

    pub fn set_id(&mut self, head: usize, row: usize, k: usize, id: i32) {
        let slot = self.slot(head, row, k);
        if let Some(t) = self.ids.as_mut() {
            t[slot] = id;
        }
    }

    /// Token side-channel transposed to batch-major `(rows, n_heads, topk)`,
    /// the layout the tracker consumes.
    pub fn tokens_batch_major(&self) -> Vec<i32> {
        self.side_batch_major(|h, r, k| self.token(h, r, k))
    }

    /// Id side-channel transposed to batch-major `(rows, n_heads, topk)`.
    pub fn ids_batch_major(&self) -> Vec<i32> {
        self.side_batch_major(|h, r, k| self.id(h, r, k))
    }

    fn side_batch_major(&self, get: impl Fn(usize, usize, usize) -> i32) -> Vec<i32> {
        let mut out = Vec::with_capacity(self.rows * self.n_heads * self.topk);
        for r in 0..self.rows {
            for h in 0..self.n_heads {
                for k in 0..self.topk {
                    out.push(get(h, r, k));
                }
            }
        }
        out
    }
}
