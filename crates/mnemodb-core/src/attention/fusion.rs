//! Retrieval-augmented attention.
//!
//! Blends retrieved (key, value) entries into a host attention step:
//! the attention mask gains `topk` unmasked columns in front, the
//! relative position bias is recomputed over the extended key length,
//! and one joint softmax covers retrieved and local columns together.
//! Retrieved columns are treated as abutting the start of local
//! context; their pairwise deltas do not encode true textual distance.

use rand::Rng;

use crate::attention::bias::PositionBias;
use crate::error::{MnemoError, Result};
use crate::tensor::{AttnBatch, RetrievedBatch};

#[derive(Debug, Clone, Copy)]
pub struct FusionConfig {
    pub n_heads: usize,
    pub head_dim: usize,
    /// Dropout probability applied to the joint attention weights.
    pub dropout: f32,
    /// Dropout only fires in training mode.
    pub training: bool,
    /// Splice retrieved entries after the first local position
    /// (conventionally the start token) instead of in front of it.
    pub add_after_first: bool,
}

/// Result of one attention step.
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    /// Joint attention weights, `(batch, n_heads, seq_len, columns)`.
    pub weights: Vec<f32>,
    /// Width of the weight rows: `topk + key_length`.
    pub columns: usize,
    /// Attention context, `(batch, seq_len, n_heads * head_dim)`,
    /// ready for the host's output projection.
    pub output: Vec<f32>,
}

pub struct AttentionFusion<'a> {
    config: FusionConfig,
    bias: &'a dyn PositionBias,
}

impl<'a> AttentionFusion<'a> {
    pub fn new(config: FusionConfig, bias: &'a dyn PositionBias) -> Self {
        Self { config, bias }
    }

    /// The host's unmodified attention computation: no retrieved
    /// columns, per-head masking honored.
    pub fn baseline<R: Rng>(
        &self,
        query: &AttnBatch,
        key: &AttnBatch,
        value: &AttnBatch,
        mask: Option<&[f32]>,
        layer_head_mask: Option<&[f32]>,
        real_seq_length: usize,
        key_length: usize,
        rng: &mut R,
    ) -> Result<AttentionOutput> {
        let empty = RetrievedBatch::empty(
            self.config.n_heads,
            query.batch() * query.len(),
            self.config.head_dim,
            false,
        );
        self.attend(
            query,
            key,
            value,
            &empty,
            mask,
            layer_head_mask,
            real_seq_length,
            key_length,
            rng,
        )
    }

    /// Attention over local plus retrieved columns. Per-head masking
    /// is unsupported while retrieval is active and fails fast.
    #[allow(clippy::too_many_arguments)]
    pub fn fuse<R: Rng>(
        &self,
        query: &AttnBatch,
        key: &AttnBatch,
        value: &AttnBatch,
        retrieved: &RetrievedBatch,
        mask: Option<&[f32]>,
        layer_head_mask: Option<&[f32]>,
        real_seq_length: usize,
        key_length: usize,
        rng: &mut R,
    ) -> Result<AttentionOutput> {
        if layer_head_mask.is_some() {
            return Err(MnemoError::Unsupported(
                "per-head masking cannot be combined with retrieval-augmented attention"
                    .to_string(),
            ));
        }
        self.attend(
            query,
            key,
            value,
            retrieved,
            mask,
            None,
            real_seq_length,
            key_length,
            rng,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn attend<R: Rng>(
        &self,
        query: &AttnBatch,
        key: &AttnBatch,
        value: &AttnBatch,
        retrieved: &RetrievedBatch,
        mask: Option<&[f32]>,
        layer_head_mask: Option<&[f32]>,
        real_seq_length: usize,
        key_length: usize,
        rng: &mut R,
    ) -> Result<AttentionOutput> {
        let cfg = &self.config;
        let batch = query.batch();
        let seq_len = query.len();
        self.check_shapes(query, key, value, retrieved, mask, key_length)?;
        if let Some(hm) = layer_head_mask {
            if hm.len() != cfg.n_heads {
                return Err(MnemoError::Config(format!(
                    "head mask has {} entries for {} heads",
                    hm.len(),
                    cfg.n_heads
                )));
            }
        }

        let topk = retrieved.topk();
        let columns = topk + key_length;

        // Bias over the extended lengths, sliced to the last `seq_len`
        // query rows (decode steps only score the newest position).
        let bias_rows = topk + real_seq_length;
        let bias = self.bias.compute(bias_rows, columns);
        if bias.len() != cfg.n_heads * bias_rows * columns {
            return Err(MnemoError::Config(format!(
                "position bias returned {} values for shape ({}, {bias_rows}, {columns})",
                bias.len(),
                cfg.n_heads
            )));
        }
        let bias_row_base = bias_rows - seq_len;

        let multi_token = seq_len > 1;
        if multi_token && !(seq_len == key_length && real_seq_length == key_length) {
            return Err(MnemoError::Config(format!(
                "multi-token attention expects seq == key == real lengths, \
                 got seq {seq_len}, key {key_length}, real {real_seq_length}"
            )));
        }
        if !multi_token && real_seq_length != key_length {
            return Err(MnemoError::Config(format!(
                "single-token attention expects real ({real_seq_length}) == key ({key_length}) length"
            )));
        }

        let splice_after_first =
            cfg.add_after_first && topk > 0 && !multi_token && key_length > 1;

        let mut weights = vec![0.0f32; batch * cfg.n_heads * seq_len * columns];
        let mut output = vec![0.0f32; batch * seq_len * cfg.n_heads * cfg.head_dim];
        let mut scores = vec![0.0f32; columns];

        for b in 0..batch {
            for h in 0..cfg.n_heads {
                for i in 0..seq_len {
                    let q = query.row(b, h, i);
                    let row = b * seq_len + i;

                    // Scores: retrieved columns first, local after —
                    // except under the splice policy, where the first
                    // local position stays in front.
                    if splice_after_first {
                        scores[0] = dot(q, key.row(b, h, 0));
                        for k in 0..topk {
                            scores[1 + k] = dot(q, retrieved.key(h, row, k));
                        }
                        for c in 1..key_length {
                            scores[topk + c] = dot(q, key.row(b, h, c));
                        }
                    } else {
                        for k in 0..topk {
                            scores[k] = dot(q, retrieved.key(h, row, k));
                        }
                        for c in 0..key_length {
                            scores[topk + c] = dot(q, key.row(b, h, c));
                        }
                    }

                    // Extended mask: retrieved columns are never masked
                    // by the local causal/padding mask.
                    let bias_row =
                        &bias[(h * bias_rows + bias_row_base + i) * columns..][..columns];
                    for c in 0..columns {
                        scores[c] += bias_row[c];
                        if c >= topk {
                            if let Some(m) = mask {
                                scores[c] += m[(b * seq_len + i) * key_length + (c - topk)];
                            }
                        }
                    }

                    softmax(&mut scores);

                    if cfg.training && cfg.dropout > 0.0 {
                        let keep = 1.0 - cfg.dropout;
                        for w in scores.iter_mut() {
                            if rng.gen::<f32>() < cfg.dropout {
                                *w = 0.0;
                            } else {
                                *w /= keep;
                            }
                        }
                    }

                    if let Some(hm) = layer_head_mask {
                        for w in scores.iter_mut() {
                            *w *= hm[h];
                        }
                    }

                    // Weighted value sum over both column ranges.
                    let out =
                        &mut output[((b * seq_len + i) * cfg.n_heads + h) * cfg.head_dim..]
                            [..cfg.head_dim];
                    if splice_after_first {
                        axpy(out, scores[0], value.row(b, h, 0));
                        for k in 0..topk {
                            axpy(out, scores[1 + k], retrieved.value(h, row, k));
                        }
                        for c in 1..key_length {
                            axpy(out, scores[topk + c], value.row(b, h, c));
                        }
                    } else {
                        for k in 0..topk {
                            axpy(out, scores[k], retrieved.value(h, row, k));
                        }
                        for c in 0..key_length {
                            axpy(out, scores[topk + c], value.row(b, h, c));
                        }
                    }

                    weights[((b * cfg.n_heads + h) * seq_len + i) * columns..][..columns]
                        .copy_from_slice(&scores);
                }
            }
        }

        Ok(AttentionOutput {
            weights,
            columns,
            output,
        })
    }

    fn check_shapes(
        &self,
        query: &AttnBatch,
        key: &AttnBatch,
        value: &AttnBatch,
        retrieved: &RetrievedBatch,
        mask: Option<&[f32]>,
        key_length: usize,
    ) -> Result<()> {
        let cfg = &self.config;
        let batch = query.batch();
        let seq_len = query.len();
        if query.n_heads() != cfg.n_heads || query.dim() != cfg.head_dim {
            return Err(MnemoError::Config(format!(
                "query shaped (_, {}, _, {}), fusion expects (_, {}, _, {})",
                query.n_heads(),
                query.dim(),
                cfg.n_heads,
                cfg.head_dim
            )));
        }
        if key.batch() != batch
            || key.n_heads() != cfg.n_heads
            || key.dim() != cfg.head_dim
            || key.len() != key_length
            || value.batch() != batch
            || value.n_heads() != cfg.n_heads
            || value.dim() != cfg.head_dim
            || value.len() != key_length
        {
            return Err(MnemoError::Config(
                "key/value shape does not match query batch and key length".to_string(),
            ));
        }
        if retrieved.n_heads() != cfg.n_heads || retrieved.dim() != cfg.head_dim {
            return Err(MnemoError::Config(format!(
                "retrieved batch shaped ({}, _, _, {}), fusion expects ({}, _, _, {})",
                retrieved.n_heads(),
                retrieved.dim(),
                cfg.n_heads,
                cfg.head_dim
            )));
        }
        if retrieved.rows() != batch * seq_len {
            return Err(MnemoError::Config(format!(
                "retrieved batch has {} rows, expected batch {batch} x seq {seq_len}",
                retrieved.rows()
            )));
        }
        if let Some(m) = mask {
            if m.len() != batch * seq_len * key_length {
                return Err(MnemoError::Config(format!(
                    "mask has {} values, expected batch {batch} x seq {seq_len} x key {key_length}",
                    m.len()
                )));
            }
        }
        Ok(())
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn axpy(out: &mut [f32], w: f32, v: &[f32]) {
    for (o, &x) in out.iter_mut().zip(v.iter()) {
        *o += w * x;
    }
}

/// In-place softmax with max subtraction, computed in f32 regardless
/// of the ambient precision the host runs at.
fn softmax(x: &mut [f32]) {
    if x.is_empty() {
        return;
    }
    let max_val = x.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for v in x.iter_mut() {
        *v = (*v - max_val).exp();
        sum += *v;
    }
    if sum > 0.0 {
        let inv = 1.0 / sum;
        for v in x.iter_mut() {
            *v *= inv;
        }
    }
}
