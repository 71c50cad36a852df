use criterion::{criterion_group, criterion_main, Criterion};
use tempfile::tempdir;

use mnemodb::{HeadVectors, IndexFlavor, StoreConfig, VectorStore};

const N_HEADS: usize = 4;
const DIM: usize = 64;
const ENTRIES: usize = 4096;

fn populated_store(dir: &std::path::Path) -> VectorStore {
    let cfg = StoreConfig {
        directory: dir.to_path_buf(),
        model_type: "bench".to_string(),
        capacity: ENTRIES,
        dimension: DIM,
        n_heads: N_HEADS,
    };
    let mut store = VectorStore::open_or_create(cfg).unwrap();

    let mut keys = HeadVectors::zeros(N_HEADS, ENTRIES, DIM);
    for h in 0..N_HEADS {
        for i in 0..ENTRIES {
            for (j, v) in keys.row_mut(h, i).iter_mut().enumerate() {
                *v = ((i * 31 + j * 7 + h) % 97) as f32 / 97.0;
            }
        }
    }
    let values = keys.clone();
    let tokens: Vec<i32> = (0..ENTRIES as i32).collect();
    let ids: Vec<i32> = (0..ENTRIES as i32).collect();
    store.append(&keys, &values, &tokens, &ids).unwrap();
    store.build_indexes(IndexFlavor::Flat, 1024).unwrap();
    store
}

fn bench_query(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let store = populated_store(dir.path());

    let mut queries = HeadVectors::zeros(N_HEADS, 8, DIM);
    for h in 0..N_HEADS {
        for r in 0..8 {
            for (j, v) in queries.row_mut(h, r).iter_mut().enumerate() {
                *v = ((r * 13 + j) % 53) as f32 / 53.0;
            }
        }
    }

    c.bench_function("flat_query_top32_batch8", |b| {
        b.iter(|| store.query(&queries, 32, false).unwrap())
    });
}

criterion_group!(benches, bench_query);
criterion_main!(benches);
