//! Deterministic backing-file paths.
//!
//! Layout under a store directory:
//! ```text
//! dstore_{model_type}_{capacity}_{dim}_keys.bin    f32 (n_heads, capacity, dim)
//! dstore_{model_type}_{capacity}_{dim}_vals.bin    f32 (n_heads, capacity, dim)
//! dstore_{model_type}_{capacity}_{dim}_tokens.bin  i32 (capacity)
//! dstore_{model_type}_{capacity}_{dim}_ids.bin     i32 (capacity)
//! dstore_{model_type}_{capacity}_{dim}.meta.json   geometry + cur_idx
//! index_{model_type}_{capacity}_{dim}_{head}.idx   serialized ANN index
//! ```

use std::path::{Path, PathBuf};

use crate::config::StoreConfig;

fn dstore_stem(cfg: &StoreConfig) -> String {
    format!(
        "dstore_{}_{}_{}",
        cfg.model_type, cfg.capacity, cfg.dimension
    )
}

pub fn keys_path(cfg: &StoreConfig) -> PathBuf {
    cfg.directory.join(format!("{}_keys.bin", dstore_stem(cfg)))
}

pub fn values_path(cfg: &StoreConfig) -> PathBuf {
    cfg.directory.join(format!("{}_vals.bin", dstore_stem(cfg)))
}

pub fn tokens_path(cfg: &StoreConfig) -> PathBuf {
    cfg.directory.join(format!("{}_tokens.bin", dstore_stem(cfg)))
}

pub fn ids_path(cfg: &StoreConfig) -> PathBuf {
    cfg.directory.join(format!("{}_ids.bin", dstore_stem(cfg)))
}

pub fn meta_path(cfg: &StoreConfig) -> PathBuf {
    cfg.directory.join(format!("{}.meta.json", dstore_stem(cfg)))
}

pub fn index_path(cfg: &StoreConfig, head: usize) -> PathBuf {
    cfg.directory.join(format!(
        "index_{}_{}_{}_{head}.idx",
        cfg.model_type, cfg.capacity, cfg.dimension
    ))
}

/// Per-layer store directory: `{base}/layer{idx}`.
pub fn layer_directory(base: &Path, layer_idx: usize) -> PathBuf {
    base.join(format!("layer{layer_idx}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> StoreConfig {
        StoreConfig {
            directory: PathBuf::from("/data/mem"),
            model_type: "t5".to_string(),
            capacity: 1000,
            dimension: 64,
            n_heads: 8,
        }
    }

    #[test]
    fn paths_are_keyed_by_geometry() {
        let c = cfg();
        assert_eq!(
            keys_path(&c),
            PathBuf::from("/data/mem/dstore_t5_1000_64_keys.bin")
        );
        assert_eq!(
            index_path(&c, 3),
            PathBuf::from("/data/mem/index_t5_1000_64_3.idx")
        );
        assert_eq!(layer_directory(Path::new("/data/mem"), 5), PathBuf::from("/data/mem/layer5"));
    }
}
