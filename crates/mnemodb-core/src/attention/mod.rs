//! Fusion of retrieved entries into a host attention computation.

mod bias;
mod fusion;

pub use bias::{NoPositionBias, PositionBias};
pub use fusion::{AttentionFusion, AttentionOutput, FusionConfig};
