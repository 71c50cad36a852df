//! On-disk format for persisted ANN indexes.
//!
//! ```text
//! magic: b"MNIX"          (4 bytes)
//! version: u16 LE         (2 bytes)
//! flavor: u8              (1 byte; 0 = flat, 1 = ivf)
//! reserved: u8            (1 byte)
//! dim: u32 LE             (4 bytes)
//! count: u64 LE           (8 bytes)
//! payload                 (flavor-specific, little-endian)
//! crc32: u32 LE           (4 bytes, over everything before it)
//! ```
//!
//! Flat payload: `count` u64 store offsets, then `count * dim` f32
//! vectors. IVF payload: nlist u32, nprobe u32, `nlist * dim` f32
//! centroids, then per cell a u64 length followed by that many
//! (offset u64, vector `dim` f32) entries.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::{MnemoError, Result};
use crate::index::ivf::PostingEntry;
use crate::index::{AnnIndex, FlatIndex, IvfIndex};

pub const INDEX_MAGIC: [u8; 4] = *b"MNIX";
pub const INDEX_VERSION: u16 = 1;

const FLAVOR_FLAT: u8 = 0;
const FLAVOR_IVF: u8 = 1;

struct CrcWriter<W: Write> {
    inner: W,
    hasher: crc32fast::Hasher,
}

impl<W: Write> CrcWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: crc32fast::Hasher::new(),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.hasher.update(bytes);
        self.inner.write_all(bytes)?;
        Ok(())
    }

    fn finish(mut self) -> Result<()> {
        let crc = self.hasher.finalize();
        self.inner.write_all(&crc.to_le_bytes())?;
        self.inner.flush()?;
        Ok(())
    }
}

fn write_f32s<W: Write>(w: &mut CrcWriter<W>, values: &[f32]) -> Result<()> {
    for &v in values {
        w.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

pub fn save(index: &AnnIndex, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(path)?;
    let mut w = CrcWriter::new(BufWriter::new(file));

    let flavor = match index {
        AnnIndex::Flat(_) => FLAVOR_FLAT,
        AnnIndex::Ivf(_) => FLAVOR_IVF,
    };
    w.write_all(&INDEX_MAGIC)?;
    w.write_all(&INDEX_VERSION.to_le_bytes())?;
    w.write_all(&[flavor, 0])?;
    w.write_all(&(index.dim() as u32).to_le_bytes())?;
    w.write_all(&(index.len() as u64).to_le_bytes())?;

    match index {
        AnnIndex::Flat(ix) => {
            for &offset in ix.offsets() {
                w.write_all(&(offset as u64).to_le_bytes())?;
            }
            write_f32s(&mut w, ix.vectors())?;
        }
        AnnIndex::Ivf(ix) => {
            w.write_all(&(ix.nlist() as u32).to_le_bytes())?;
            w.write_all(&(ix.nprobe() as u32).to_le_bytes())?;
            write_f32s(&mut w, ix.centroids())?;
            for list in ix.lists() {
                w.write_all(&(list.len() as u64).to_le_bytes())?;
                for entry in list {
                    w.write_all(&(entry.offset as u64).to_le_bytes())?;
                    write_f32s(&mut w, &entry.vector)?;
                }
            }
        }
    }

    w.finish()
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(MnemoError::IndexFormat("truncated index blob".to_string()));
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn f32s(&mut self, count: usize) -> Result<Vec<f32>> {
        let b = self.take(count * 4)?;
        Ok(b.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

pub fn load(path: &Path) -> Result<AnnIndex> {
    let bytes = std::fs::read(path)?;
    if bytes.len() < 20 + 4 {
        return Err(MnemoError::IndexFormat("index blob too short".to_string()));
    }

    let body_len = bytes.len() - 4;
    let stored_crc = u32::from_le_bytes([
        bytes[body_len],
        bytes[body_len + 1],
        bytes[body_len + 2],
        bytes[body_len + 3],
    ]);
    let actual_crc = crc32fast::hash(&bytes[..body_len]);
    if stored_crc != actual_crc {
        return Err(MnemoError::IndexFormat(format!(
            "crc mismatch: stored {stored_crc:#010x}, computed {actual_crc:#010x}"
        )));
    }

    let mut r = Reader {
        bytes: &bytes[..body_len],
        pos: 0,
    };
    if r.take(4)? != INDEX_MAGIC {
        return Err(MnemoError::IndexFormat("bad magic".to_string()));
    }
    let version = r.u16()?;
    if version != INDEX_VERSION {
        return Err(MnemoError::IndexFormat(format!(
            "unsupported version {version}"
        )));
    }
    let flavor = r.take(2)?[0];
    let dim = r.u32()? as usize;
    let count = r.u64()? as usize;

    match flavor {
        FLAVOR_FLAT => {
            let mut offsets = Vec::with_capacity(count);
            for _ in 0..count {
                offsets.push(r.u64()? as usize);
            }
            let vectors = r.f32s(count * dim)?;
            Ok(AnnIndex::Flat(FlatIndex::from_parts(dim, vectors, offsets)))
        }
        FLAVOR_IVF => {
            let nlist = r.u32()? as usize;
            let nprobe = r.u32()? as usize;
            let centroids = r.f32s(nlist * dim)?;
            let mut lists = Vec::with_capacity(nlist);
            for _ in 0..nlist {
                let len = r.u64()? as usize;
                let mut list = Vec::with_capacity(len);
                for _ in 0..len {
                    let offset = r.u64()? as usize;
                    let vector = r.f32s(dim)?;
                    list.push(PostingEntry { offset, vector });
                }
                lists.push(list);
            }
            Ok(AnnIndex::Ivf(IvfIndex::from_parts(
                dim, nlist, nprobe, centroids, lists,
            )))
        }
        other => Err(MnemoError::IndexFormat(format!(
            "unknown index flavor byte {other}"
        ))),
    }
}
