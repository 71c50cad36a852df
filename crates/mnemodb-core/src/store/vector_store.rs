//! Append-only, memory-mapped key/value store.
//!
//! Four parallel backing files per store: keys and values as f32
//! `(n_heads, capacity, dim)` planes, token and id side-channels as
//! i32 `(capacity)` — the side-channels describe token positions, so
//! they are shared across heads. A JSON sidecar records the geometry
//! and the write cursor.
//!
//! A store created fresh is writable; a store opened from existing
//! files is frozen and only serves reads. One writer xor many readers,
//! by operational convention — there is no in-process locking.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::time::Instant;

use memmap2::{Mmap, MmapMut};
use serde::{Deserialize, Serialize};

use crate::config::{IndexFlavor, StoreConfig};
use crate::error::{MnemoError, Result};
use crate::index::{AnnIndex, AnnIndexBuilder, RaggedIndex};
use crate::store::layout;
use crate::tensor::{HeadVectors, RetrievedBatch};

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct StoreMeta {
    model_type: String,
    capacity: usize,
    dimension: usize,
    n_heads: usize,
    cur_idx: usize,
}

#[derive(Debug)]
enum Backing {
    /// Fresh store owned by a collection run.
    Writable {
        keys: MmapMut,
        values: MmapMut,
        tokens: MmapMut,
        ids: MmapMut,
    },
    /// Existing store opened for querying.
    Frozen {
        keys: Mmap,
        values: Mmap,
        tokens: Mmap,
        ids: Mmap,
    },
    /// Frozen store copied into heap memory for faster random gather.
    Heap {
        keys: Vec<f32>,
        values: Vec<f32>,
        tokens: Vec<i32>,
        ids: Vec<i32>,
    },
}

impl Backing {
    fn read_key_row(&self, plane_row: usize, dim: usize, out: &mut [f32]) {
        match self {
            Backing::Writable { keys, .. } => read_f32_row(keys, plane_row, dim, out),
            Backing::Frozen { keys, .. } => read_f32_row(keys, plane_row, dim, out),
            Backing::Heap { keys, .. } => {
                out.copy_from_slice(&keys[plane_row * dim..(plane_row + 1) * dim]);
            }
        }
    }

    fn read_value_row(&self, plane_row: usize, dim: usize, out: &mut [f32]) {
        match self {
            Backing::Writable { values, .. } => read_f32_row(values, plane_row, dim, out),
            Backing::Frozen { values, .. } => read_f32_row(values, plane_row, dim, out),
            Backing::Heap { values, .. } => {
                out.copy_from_slice(&values[plane_row * dim..(plane_row + 1) * dim]);
            }
        }
    }

    fn token_at(&self, idx: usize) -> i32 {
        match self {
            Backing::Writable { tokens, .. } => read_i32(tokens, idx),
            Backing::Frozen { tokens, .. } => read_i32(tokens, idx),
            Backing::Heap { tokens, .. } => tokens[idx],
        }
    }

    fn id_at(&self, idx: usize) -> i32 {
        match self {
            Backing::Writable { ids, .. } => read_i32(ids, idx),
            Backing::Frozen { ids, .. } => read_i32(ids, idx),
            Backing::Heap { ids, .. } => ids[idx],
        }
    }
}

fn read_f32_row(bytes: &[u8], plane_row: usize, dim: usize, out: &mut [f32]) {
    let start = plane_row * dim * 4;
    for (j, chunk) in bytes[start..start + dim * 4].chunks_exact(4).enumerate() {
        out[j] = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
}

fn write_f32_row(bytes: &mut [u8], plane_row: usize, dim: usize, row: &[f32]) {
    let start = plane_row * dim * 4;
    for (j, &v) in row.iter().enumerate() {
        bytes[start + j * 4..start + (j + 1) * 4].copy_from_slice(&v.to_le_bytes());
    }
}

fn read_i32(bytes: &[u8], idx: usize) -> i32 {
    let start = idx * 4;
    i32::from_le_bytes([
        bytes[start],
        bytes[start + 1],
        bytes[start + 2],
        bytes[start + 3],
    ])
}

fn write_i32(bytes: &mut [u8], idx: usize, v: i32) {
    bytes[idx * 4..(idx + 1) * 4].copy_from_slice(&v.to_le_bytes());
}

#[derive(Debug)]
pub struct VectorStore {
    cfg: StoreConfig,
    backing: Backing,
    cur_idx: usize,
    indexes: Vec<Option<AnnIndex>>,
    ragged: Option<RaggedIndex>,
}

impl VectorStore {
    /// Open existing backing files read-only, or create fresh
    /// zero-filled writable ones.
    pub fn open_or_create(cfg: StoreConfig) -> Result<Self> {
        cfg.validate()?;
        let start = Instant::now();
        let keys_path = layout::keys_path(&cfg);
        let exists = keys_path.exists();
        let store = if exists {
            Self::open_frozen(cfg)?
        } else {
            Self::create_writable(cfg)?
        };
        tracing::info!(
            path = %keys_path.display(),
            frozen = exists,
            cur_idx = store.cur_idx,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "opened datastore"
        );
        Ok(store)
    }

    fn plane_bytes(cfg: &StoreConfig) -> u64 {
        (cfg.n_heads * cfg.capacity * cfg.dimension * 4) as u64
    }

    fn side_bytes(cfg: &StoreConfig) -> u64 {
        (cfg.capacity * 4) as u64
    }

    fn create_writable(cfg: StoreConfig) -> Result<Self> {
        std::fs::create_dir_all(&cfg.directory)?;
        let create = |path: PathBuf, len: u64| -> Result<MmapMut> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(path)?;
            file.set_len(len)?;
            // Safety: the file was just created and sized by us; no
            // other process maps it during the save stage.
            Ok(unsafe { MmapMut::map_mut(&file)? })
        };
        let keys = create(layout::keys_path(&cfg), Self::plane_bytes(&cfg))?;
        let values = create(layout::values_path(&cfg), Self::plane_bytes(&cfg))?;
        let tokens = create(layout::tokens_path(&cfg), Self::side_bytes(&cfg))?;
        let ids = create(layout::ids_path(&cfg), Self::side_bytes(&cfg))?;

        let n_heads = cfg.n_heads;
        let store = Self {
            cfg,
            backing: Backing::Writable {
                keys,
                values,
                tokens,
                ids,
            },
            cur_idx: 0,
            indexes: (0..n_heads).map(|_| None).collect(),
            ragged: None,
        };
        store.write_meta()?;
        Ok(store)
    }

    fn open_frozen(cfg: StoreConfig) -> Result<Self> {
        let meta_path = layout::meta_path(&cfg);
        if !meta_path.exists() {
            return Err(MnemoError::StoreFormat(format!(
                "backing files exist but the meta sidecar {} is missing; \
                 the store is from an interrupted collection run — delete and rebuild",
                meta_path.display()
            )));
        }
        let meta: StoreMeta = serde_json::from_slice(&std::fs::read(&meta_path)?)?;
        if meta.model_type != cfg.model_type
            || meta.capacity != cfg.capacity
            || meta.dimension != cfg.dimension
            || meta.n_heads != cfg.n_heads
        {
            return Err(MnemoError::StoreFormat(format!(
                "meta sidecar geometry ({}, cap {}, dim {}, heads {}) does not match \
                 the configured store ({}, cap {}, dim {}, heads {})",
                meta.model_type,
                meta.capacity,
                meta.dimension,
                meta.n_heads,
                cfg.model_type,
                cfg.capacity,
                cfg.dimension,
                cfg.n_heads
            )));
        }
        if meta.cur_idx > meta.capacity {
            return Err(MnemoError::StoreFormat(format!(
                "meta sidecar cur_idx {} exceeds capacity {}",
                meta.cur_idx, meta.capacity
            )));
        }

        let open = |path: PathBuf, expected: u64| -> Result<Mmap> {
            let file = OpenOptions::new().read(true).open(&path)?;
            let actual = file.metadata()?.len();
            if actual != expected {
                return Err(MnemoError::StoreFormat(format!(
                    "{} is {actual} bytes, expected {expected}",
                    path.display()
                )));
            }
            // Safety: mapped read-only; the save stage that wrote this
            // store has finished (operational convention).
            Ok(unsafe { Mmap::map(&file)? })
        };
        let keys = open(layout::keys_path(&cfg), Self::plane_bytes(&cfg))?;
        let values = open(layout::values_path(&cfg), Self::plane_bytes(&cfg))?;
        let tokens = open(layout::tokens_path(&cfg), Self::side_bytes(&cfg))?;
        let ids = open(layout::ids_path(&cfg), Self::side_bytes(&cfg))?;

        let n_heads = cfg.n_heads;
        Ok(Self {
            cfg,
            backing: Backing::Frozen {
                keys,
                values,
                tokens,
                ids,
            },
            cur_idx: meta.cur_idx,
            indexes: (0..n_heads).map(|_| None).collect(),
            ragged: None,
        })
    }

    fn write_meta(&self) -> Result<()> {
        let meta = StoreMeta {
            model_type: self.cfg.model_type.clone(),
            capacity: self.cfg.capacity,
            dimension: self.cfg.dimension,
            n_heads: self.cfg.n_heads,
            cur_idx: self.cur_idx,
        };
        std::fs::write(layout::meta_path(&self.cfg), serde_json::to_vec_pretty(&meta)?)?;
        Ok(())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.cfg
    }

    pub fn n_heads(&self) -> usize {
        self.cfg.n_heads
    }

    pub fn dim(&self) -> usize {
        self.cfg.dimension
    }

    pub fn capacity(&self) -> usize {
        self.cfg.capacity
    }

    /// Next free write offset; also the number of valid entries.
    pub fn cur_idx(&self) -> usize {
        self.cur_idx
    }

    pub fn is_read_only(&self) -> bool {
        !matches!(self.backing, Backing::Writable { .. })
    }

    pub fn token_at(&self, idx: usize) -> i32 {
        self.backing.token_at(idx)
    }

    pub fn id_at(&self, idx: usize) -> i32 {
        self.backing.id_at(idx)
    }

    /// Append `(keys, values, tokens, ids)` for a batch of token
    /// positions. Keys/values are `(n_heads, n_new, dim)`; tokens/ids
    /// are `(n_new)`.
    ///
    /// A batch that would overflow the remaining capacity is truncated
    /// to fit — collection jobs degrade instead of aborting near the
    /// end. Returns the number of entries actually written.
    pub fn append(
        &mut self,
        keys: &HeadVectors,
        values: &HeadVectors,
        tokens: &[i32],
        ids: &[i32],
    ) -> Result<usize> {
        if keys.n_heads() != self.cfg.n_heads || keys.dim() != self.cfg.dimension {
            return Err(MnemoError::Config(format!(
                "append keys shaped ({}, _, {}), store expects ({}, _, {})",
                keys.n_heads(),
                keys.dim(),
                self.cfg.n_heads,
                self.cfg.dimension
            )));
        }
        if values.n_heads() != keys.n_heads()
            || values.dim() != keys.dim()
            || values.len() != keys.len()
        {
            return Err(MnemoError::Config(
                "append values shape differs from keys".to_string(),
            ));
        }
        if tokens.len() != keys.len() || ids.len() != keys.len() {
            return Err(MnemoError::Config(format!(
                "append side-channels ({} tokens, {} ids) differ from {} rows",
                tokens.len(),
                ids.len(),
                keys.len()
            )));
        }

        let (keys_mm, values_mm, tokens_mm, ids_mm) = match &mut self.backing {
            Backing::Writable {
                keys,
                values,
                tokens,
                ids,
            } => (keys, values, tokens, ids),
            _ => return Err(MnemoError::ReadOnlyStore(layout::keys_path(&self.cfg))),
        };

        let n_new = keys.len();
        let remaining = self.cfg.capacity - self.cur_idx;
        let n_write = n_new.min(remaining);
        if n_write < n_new {
            tracing::warn!(
                capacity = self.cfg.capacity,
                cur_idx = self.cur_idx,
                dropped = n_new - n_write,
                "datastore full, truncating append batch"
            );
        }
        if n_write == 0 {
            return Ok(0);
        }

        let dim = self.cfg.dimension;
        let capacity = self.cfg.capacity;
        for h in 0..self.cfg.n_heads {
            for i in 0..n_write {
                let plane_row = h * capacity + self.cur_idx + i;
                write_f32_row(keys_mm, plane_row, dim, keys.row(h, i));
                write_f32_row(values_mm, plane_row, dim, values.row(h, i));
            }
        }
        for i in 0..n_write {
            write_i32(tokens_mm, self.cur_idx + i, tokens[i]);
            write_i32(ids_mm, self.cur_idx + i, ids[i]);
        }

        self.cur_idx += n_write;
        self.write_meta()?;
        Ok(n_write)
    }

    /// Flush mapped pages and the meta sidecar to disk.
    pub fn sync(&self) -> Result<()> {
        if let Backing::Writable {
            keys,
            values,
            tokens,
            ids,
        } = &self.backing
        {
            keys.flush()?;
            values.flush()?;
            tokens.flush()?;
            ids.flush()?;
        }
        self.write_meta()
    }

    /// Copy a frozen store into heap memory so gathers stop paying
    /// page-fault latency. No-op for writable or already-copied stores.
    pub fn preload(&mut self) -> Result<()> {
        let start = Instant::now();
        if let Backing::Frozen { .. } = &self.backing {
            let plane = self.cfg.n_heads * self.cfg.capacity;
            let dim = self.cfg.dimension;
            let mut keys = vec![0.0f32; plane * dim];
            let mut values = vec![0.0f32; plane * dim];
            for row in 0..plane {
                self.backing
                    .read_key_row(row, dim, &mut keys[row * dim..(row + 1) * dim]);
                self.backing
                    .read_value_row(row, dim, &mut values[row * dim..(row + 1) * dim]);
            }
            let tokens = (0..self.cfg.capacity).map(|i| self.backing.token_at(i)).collect();
            let ids = (0..self.cfg.capacity).map(|i| self.backing.id_at(i)).collect();
            self.backing = Backing::Heap {
                keys,
                values,
                tokens,
                ids,
            };
            tracing::info!(
                elapsed_ms = start.elapsed().as_millis() as u64,
                "moved datastore to memory"
            );
        }
        Ok(())
    }

    /// Build, persist and retain the ANN index for one head over the
    /// `cur_idx` valid entries, inserting in `batch_size` chunks.
    /// Rerunning with identical keys rewrites an identical blob.
    pub fn build_index(
        &mut self,
        head: usize,
        flavor: IndexFlavor,
        batch_size: usize,
    ) -> Result<()> {
        if head >= self.cfg.n_heads {
            return Err(MnemoError::Config(format!(
                "head {head} out of range for {} heads",
                self.cfg.n_heads
            )));
        }
        if batch_size == 0 {
            return Err(MnemoError::Config("index batch_size must be > 0".to_string()));
        }
        let start = Instant::now();
        let dim = self.cfg.dimension;
        let mut builder = AnnIndexBuilder::new(flavor, dim);

        if builder.needs_training() && self.cur_idx > 0 {
            let all = self.copy_head_keys(head, 0, self.cur_idx);
            builder.train(&all, self.cur_idx)?;
        }
        let mut base = 0;
        while base < self.cur_idx {
            let n = batch_size.min(self.cur_idx - base);
            let chunk = self.copy_head_keys(head, base, n);
            builder.add(&chunk, n, base)?;
            base += n;
        }

        let index = builder.finish();
        index.save(&layout::index_path(&self.cfg, head))?;
        tracing::info!(
            head,
            entries = self.cur_idx,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "built index"
        );
        self.indexes[head] = Some(index);
        Ok(())
    }

    /// Build and persist indexes for every head.
    pub fn build_indexes(&mut self, flavor: IndexFlavor, batch_size: usize) -> Result<()> {
        for head in 0..self.cfg.n_heads {
            self.build_index(head, flavor, batch_size)?;
        }
        Ok(())
    }

    fn copy_head_keys(&self, head: usize, base: usize, n: usize) -> Vec<f32> {
        let dim = self.cfg.dimension;
        let mut out = vec![0.0f32; n * dim];
        for i in 0..n {
            let plane_row = head * self.cfg.capacity + base + i;
            self.backing
                .read_key_row(plane_row, dim, &mut out[i * dim..(i + 1) * dim]);
        }
        out
    }

    /// Load the persisted index for one head.
    pub fn load_index(&mut self, head: usize) -> Result<()> {
        if head >= self.cfg.n_heads {
            return Err(MnemoError::Config(format!(
                "head {head} out of range for {} heads",
                self.cfg.n_heads
            )));
        }
        let path = layout::index_path(&self.cfg, head);
        let index = AnnIndex::load(&path)?;
        if index.dim() != self.cfg.dimension {
            return Err(MnemoError::IndexFormat(format!(
                "index at {} has dim {}, store expects {}",
                path.display(),
                index.dim(),
                self.cfg.dimension
            )));
        }
        self.indexes[head] = Some(index);
        Ok(())
    }

    /// Load persisted indexes for every head.
    pub fn load_indexes(&mut self) -> Result<()> {
        let start = Instant::now();
        for head in 0..self.cfg.n_heads {
            self.load_index(head)?;
        }
        tracing::info!(
            heads = self.cfg.n_heads,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "loaded indexes"
        );
        Ok(())
    }

    /// Top-k similarity search per head. `queries` is
    /// `(n_heads, rows, dim)`. `topk == 0` yields a well-formed
    /// zero-width result without touching any index, so callers can
    /// disable retrieval without branching.
    pub fn query(
        &self,
        queries: &HeadVectors,
        topk: usize,
        with_side_channels: bool,
    ) -> Result<RetrievedBatch> {
        if queries.n_heads() != self.cfg.n_heads || queries.dim() != self.cfg.dimension {
            return Err(MnemoError::Config(format!(
                "queries shaped ({}, _, {}), store expects ({}, _, {})",
                queries.n_heads(),
                queries.dim(),
                self.cfg.n_heads,
                self.cfg.dimension
            )));
        }
        let rows = queries.len();
        if topk == 0 {
            return Ok(RetrievedBatch::empty(
                self.cfg.n_heads,
                rows,
                self.cfg.dimension,
                with_side_channels,
            ));
        }

        let dim = self.cfg.dimension;
        let mut out = RetrievedBatch::zeros(self.cfg.n_heads, rows, topk, dim, with_side_channels);
        for head in 0..self.cfg.n_heads {
            let index = self.indexes[head]
                .as_ref()
                .ok_or_else(|| MnemoError::IndexNotFound(layout::index_path(&self.cfg, head)))?;
            for r in 0..rows {
                let hits = index.search(queries.row(head, r), topk);
                for (k, hit) in hits.iter().enumerate() {
                    let plane_row = head * self.cfg.capacity + hit.offset;
                    self.backing.read_key_row(plane_row, dim, out.key_mut(head, r, k));
                    self.backing
                        .read_value_row(plane_row, dim, out.value_mut(head, r, k));
                    if with_side_channels {
                        out.set_token(head, r, k, self.backing.token_at(hit.offset));
                        out.set_id(head, r, k, self.backing.id_at(hit.offset));
                    }
                }
            }
        }
        Ok(out)
    }

    /// Derive the by-id span table from the id side-channel. Call once
    /// after the store is frozen for querying.
    pub fn build_ragged(&mut self) -> Result<()> {
        let ids: Vec<i32> = (0..self.cur_idx).map(|i| self.backing.id_at(i)).collect();
        self.ragged = Some(RaggedIndex::build(&ids)?);
        Ok(())
    }

    pub fn ragged(&self) -> Option<&RaggedIndex> {
        self.ragged.as_ref()
    }

    /// Gather the contiguous span of every example id in `example_ids`,
    /// right-padded with zeros to `max_len` (longer spans are silently
    /// truncated). `skip_first` drops the first slot of every span,
    /// conventionally a start-of-sequence token.
    pub fn lookup_by_ids(
        &self,
        example_ids: &[i32],
        max_len: usize,
        skip_first: bool,
        with_side_channels: bool,
    ) -> Result<RetrievedBatch> {
        let ragged = self.ragged.as_ref().ok_or_else(|| {
            MnemoError::Config(
                "by-id lookup requires the ragged id index; call build_ragged() first".to_string(),
            )
        })?;

        let rows = example_ids.len();
        let dim = self.cfg.dimension;
        let mut out =
            RetrievedBatch::zeros(self.cfg.n_heads, rows, max_len, dim, with_side_channels);
        for (r, &ex) in example_ids.iter().enumerate() {
            let span = usize::try_from(ex).ok().and_then(|ex| ragged.span(ex));
            let (mut start, end) = span.ok_or_else(|| {
                MnemoError::MalformedIndex(format!("example id {ex} not present in the store"))
            })?;
            if skip_first && start < end {
                start += 1;
            }
            let n = (end - start).min(max_len);
            for head in 0..self.cfg.n_heads {
                for k in 0..n {
                    let plane_row = head * self.cfg.capacity + start + k;
                    self.backing.read_key_row(plane_row, dim, out.key_mut(head, r, k));
                    self.backing
                        .read_value_row(plane_row, dim, out.value_mut(head, r, k));
                    if with_side_channels {
                        out.set_token(head, r, k, self.backing.token_at(start + k));
                        out.set_id(head, r, k, self.backing.id_at(start + k));
                    }
                }
            }
        }
        Ok(out)
    }
}

impl Drop for VectorStore {
    fn drop(&mut self) {
        if !self.is_read_only() {
            if let Err(e) = self.sync() {
                tracing::warn!(error = %e, "failed to sync datastore on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn cfg(dir: &std::path::Path, capacity: usize) -> StoreConfig {
        StoreConfig {
            directory: dir.to_path_buf(),
            model_type: "t5".to_string(),
            capacity,
            dimension: 4,
            n_heads: 2,
        }
    }

    fn filled(n_heads: usize, len: usize, dim: usize, scale: f32) -> HeadVectors {
        let mut hv = HeadVectors::zeros(n_heads, len, dim);
        for h in 0..n_heads {
            for i in 0..len {
                for (j, v) in hv.row_mut(h, i).iter_mut().enumerate() {
                    *v = scale * (1.0 + h as f32 + i as f32 * 0.1 + j as f32 * 0.01);
                }
            }
        }
        hv
    }

    #[test]
    fn fresh_store_is_writable_and_reopens_frozen() {
        let dir = tempdir().unwrap();
        let c = cfg(dir.path(), 8);
        {
            let mut store = VectorStore::open_or_create(c.clone()).unwrap();
            assert!(!store.is_read_only());
            let keys = filled(2, 3, 4, 1.0);
            let values = filled(2, 3, 4, 2.0);
            let written = store.append(&keys, &values, &[5, 6, 7], &[0, 0, 1]).unwrap();
            assert_eq!(written, 3);
            assert_eq!(store.cur_idx(), 3);
        }

        let store = VectorStore::open_or_create(c).unwrap();
        assert!(store.is_read_only());
        assert_eq!(store.cur_idx(), 3);
        assert_eq!(store.token_at(1), 6);
        assert_eq!(store.id_at(2), 1);
    }

    #[test]
    fn append_on_frozen_store_fails() {
        let dir = tempdir().unwrap();
        let c = cfg(dir.path(), 4);
        drop(VectorStore::open_or_create(c.clone()).unwrap());

        let mut store = VectorStore::open_or_create(c).unwrap();
        let keys = filled(2, 1, 4, 1.0);
        let values = filled(2, 1, 4, 1.0);
        assert!(matches!(
            store.append(&keys, &values, &[1], &[0]),
            Err(MnemoError::ReadOnlyStore(_))
        ));
    }

    #[test]
    fn overflow_truncates_without_error() {
        let dir = tempdir().unwrap();
        let mut store = VectorStore::open_or_create(cfg(dir.path(), 3)).unwrap();

        let keys = filled(2, 2, 4, 1.0);
        let values = filled(2, 2, 4, 1.0);
        assert_eq!(store.append(&keys, &values, &[1, 2], &[0, 0]).unwrap(), 2);
        // Only one slot left: batch of two is cut to one.
        assert_eq!(store.append(&keys, &values, &[3, 4], &[1, 1]).unwrap(), 1);
        assert_eq!(store.cur_idx(), 3);
        // Full store: nothing more is written, still no error.
        assert_eq!(store.append(&keys, &values, &[5, 6], &[2, 2]).unwrap(), 0);
        assert_eq!(store.cur_idx(), 3);
    }

    #[test]
    fn shape_mismatch_fails_before_any_write() {
        let dir = tempdir().unwrap();
        let mut store = VectorStore::open_or_create(cfg(dir.path(), 4)).unwrap();

        let keys = filled(2, 2, 4, 1.0);
        let values = filled(2, 2, 4, 1.0);
        assert!(store.append(&keys, &values, &[1], &[0, 0]).is_err());
        assert_eq!(store.cur_idx(), 0);

        let bad_heads = filled(3, 2, 4, 1.0);
        assert!(store.append(&bad_heads, &values, &[1, 2], &[0, 0]).is_err());
        assert_eq!(store.cur_idx(), 0);
    }

    #[test]
    fn wrong_size_backing_file_is_rejected() {
        let dir = tempdir().unwrap();
        let c = cfg(dir.path(), 4);
        drop(VectorStore::open_or_create(c.clone()).unwrap());
        // Corrupt the keys file length.
        let keys_path = layout::keys_path(&c);
        let file = OpenOptions::new().write(true).open(&keys_path).unwrap();
        file.set_len(8).unwrap();
        assert!(matches!(
            VectorStore::open_or_create(c),
            Err(MnemoError::StoreFormat(_))
        ));
    }

    #[test]
    fn query_topk_zero_is_empty_without_indexes() {
        let dir = tempdir().unwrap();
        let store = VectorStore::open_or_create(cfg(dir.path(), 4)).unwrap();
        let queries = filled(2, 2, 4, 1.0);
        // No index was ever built or loaded; topk == 0 must still work.
        let out = store.query(&queries, 0, true).unwrap();
        assert_eq!(out.topk(), 0);
        assert_eq!(out.rows(), 2);
    }

    #[test]
    fn query_without_index_is_index_not_found() {
        let dir = tempdir().unwrap();
        let store = VectorStore::open_or_create(cfg(dir.path(), 4)).unwrap();
        let queries = filled(2, 1, 4, 1.0);
        assert!(matches!(
            store.query(&queries, 2, false),
            Err(MnemoError::IndexNotFound(_))
        ));
    }

    #[test]
    fn append_build_query_roundtrip() {
        let dir = tempdir().unwrap();
        let mut store = VectorStore::open_or_create(cfg(dir.path(), 3)).unwrap();

        // Two distinct entries per head.
        let mut keys = HeadVectors::zeros(2, 2, 4);
        keys.row_mut(0, 0).copy_from_slice(&[1.0, 0.0, 0.0, 0.0]);
        keys.row_mut(0, 1).copy_from_slice(&[0.0, 1.0, 0.0, 0.0]);
        keys.row_mut(1, 0).copy_from_slice(&[0.0, 0.0, 1.0, 0.0]);
        keys.row_mut(1, 1).copy_from_slice(&[0.0, 0.0, 0.0, 1.0]);
        let values = filled(2, 2, 4, 3.0);
        store.append(&keys, &values, &[11, 22], &[0, 1]).unwrap();

        store.build_indexes(IndexFlavor::Flat, 1).unwrap();

        // Query with the stored keys themselves: each must come back
        // as its own top-1 match.
        let out = store.query(&keys, 2, true).unwrap();
        assert_eq!(out.topk(), 2);
        for head in 0..2 {
            assert_eq!(out.key(head, 0, 0), keys.row(head, 0));
            assert_eq!(out.key(head, 1, 0), keys.row(head, 1));
            assert_eq!(out.token(head, 0, 0), 11);
            assert_eq!(out.token(head, 1, 0), 22);
        }
    }

    #[test]
    fn persisted_index_loads_in_fresh_process() {
        let dir = tempdir().unwrap();
        let c = cfg(dir.path(), 4);
        {
            let mut store = VectorStore::open_or_create(c.clone()).unwrap();
            let keys = filled(2, 2, 4, 1.0);
            let values = filled(2, 2, 4, 2.0);
            store.append(&keys, &values, &[1, 2], &[0, 1]).unwrap();
            store.build_indexes(IndexFlavor::Flat, 1000).unwrap();
        }

        let mut store = VectorStore::open_or_create(c).unwrap();
        store.load_indexes().unwrap();
        let queries = filled(2, 1, 4, 1.0);
        let out = store.query(&queries, 1, false).unwrap();
        assert_eq!(out.topk(), 1);
    }

    #[test]
    fn by_id_lookup_pads_and_truncates() {
        let dir = tempdir().unwrap();
        let mut store = VectorStore::open_or_create(cfg(dir.path(), 6)).unwrap();

        let keys = filled(2, 6, 4, 1.0);
        let values = filled(2, 6, 4, 2.0);
        store
            .append(&keys, &values, &[1, 2, 3, 4, 5, 6], &[0, 0, 1, 1, 1, 2])
            .unwrap();
        store.build_ragged().unwrap();

        let out = store.lookup_by_ids(&[1, 2], 2, false, true).unwrap();
        assert_eq!(out.topk(), 2);
        // Example 1 spans offsets 2..5, truncated to two slots.
        assert_eq!(out.key(0, 0, 0), keys.row(0, 2));
        assert_eq!(out.token(0, 0, 1), 4);
        // Example 2 has a single entry; the second slot stays zero.
        assert_eq!(out.key(0, 1, 0), keys.row(0, 5));
        assert_eq!(out.key(0, 1, 1), &[0.0; 4]);
        assert_eq!(out.token(0, 1, 1), 0);
    }

    #[test]
    fn by_id_lookup_can_skip_first_token() {
        let dir = tempdir().unwrap();
        let mut store = VectorStore::open_or_create(cfg(dir.path(), 4)).unwrap();

        let keys = filled(2, 3, 4, 1.0);
        let values = filled(2, 3, 4, 2.0);
        store.append(&keys, &values, &[9, 8, 7], &[0, 0, 0]).unwrap();
        store.build_ragged().unwrap();

        let out = store.lookup_by_ids(&[0], 4, true, true).unwrap();
        assert_eq!(out.key(0, 0, 0), keys.row(0, 1));
        assert_eq!(out.token(0, 0, 0), 8);
        assert_eq!(out.token(0, 0, 2), 0);
    }

    #[test]
    fn unknown_example_id_is_malformed() {
        let dir = tempdir().unwrap();
        let mut store = VectorStore::open_or_create(cfg(dir.path(), 4)).unwrap();
        let keys = filled(2, 1, 4, 1.0);
        let values = filled(2, 1, 4, 1.0);
        store.append(&keys, &values, &[1], &[0]).unwrap();
        store.build_ragged().unwrap();
        assert!(matches!(
            store.lookup_by_ids(&[5], 2, false, false),
            Err(MnemoError::MalformedIndex(_))
        ));
    }

    #[test]
    fn preload_preserves_contents() {
        let dir = tempdir().unwrap();
        let c = cfg(dir.path(), 4);
        let keys = filled(2, 2, 4, 1.0);
        {
            let mut store = VectorStore::open_or_create(c.clone()).unwrap();
            let values = filled(2, 2, 4, 2.0);
            store.append(&keys, &values, &[3, 4], &[0, 1]).unwrap();
            store.build_indexes(IndexFlavor::Flat, 100).unwrap();
        }

        let mut store = VectorStore::open_or_create(c).unwrap();
        store.load_indexes().unwrap();
        store.preload().unwrap();
        assert_eq!(store.token_at(1), 4);
        let out = store.query(&keys, 1, false).unwrap();
        assert_eq!(out.key(0, 0, 0), keys.row(0, 0));
    }
}
