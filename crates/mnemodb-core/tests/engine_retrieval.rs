//! Integration tests for the save/retrieve orchestration: label
//! masking, id assignment, topk policy, by-id caching and tracking.

use std::path::Path;

use tempfile::tempdir;

use mnemodb::{
    AttentionAugmentation, AttnBatch, IndexFlavor, MnemoError, RetrievalConfig, RetrievalEngine,
    RetrievalSession, RetrievalTracker, Stage, StoreConfig, VectorStore,
};

const N_HEADS: usize = 2;
const DIM: usize = 4;

fn store_config(dir: &Path, capacity: usize) -> StoreConfig {
    StoreConfig {
        directory: dir.to_path_buf(),
        model_type: "t5".to_string(),
        capacity,
        dimension: DIM,
        n_heads: N_HEADS,
    }
}

fn save_engine(dir: &Path, capacity: usize) -> RetrievalEngine {
    let store = VectorStore::open_or_create(store_config(dir, capacity)).unwrap();
    RetrievalEngine::new(store, RetrievalConfig::default(), Stage::Save, None).unwrap()
}

fn retrieve_engine(
    dir: &Path,
    capacity: usize,
    config: RetrievalConfig,
    tracker: Option<RetrievalTracker>,
) -> RetrievalEngine {
    let mut store = VectorStore::open_or_create(store_config(dir, capacity)).unwrap();
    store.load_indexes().unwrap();
    if config.by_ids {
        store.build_ragged().unwrap();
    }
    RetrievalEngine::new(store, config, Stage::Retrieve, tracker).unwrap()
}

/// Distinct unit-ish projections per (batch, head, position).
fn projections(batch: usize, seq: usize) -> AttnBatch {
    let mut t = AttnBatch::zeros(batch, N_HEADS, seq, DIM);
    for b in 0..batch {
        for h in 0..N_HEADS {
            for i in 0..seq {
                t.row_mut(b, h, i)[(b * seq + i) % DIM] = 1.0 + h as f32 * 0.5;
            }
        }
    }
    t
}

/// Populate a two-example store: example 0 has two entries, example 1
/// has one. Returns after indexes are persisted.
fn collect_small_corpus(dir: &Path, capacity: usize) {
    let mut engine = save_engine(dir, capacity);
    let mut session = RetrievalSession::new();

    let keys = projections(2, 2);
    let values = projections(2, 2);
    // Batch row 0 keeps both positions, row 1 keeps only the first.
    let label_mask = [true, true, true, false];
    let tokens = [11, 12, 21, 22];
    engine
        .save(&mut session, &keys, &values, &label_mask, &tokens)
        .unwrap();
    assert_eq!(session.id_offset(), 2);

    engine.build_indexes().unwrap();
}

// ── Save stage ──────────────────────────────────────────────────────────────

#[test]
fn save_masks_positions_and_assigns_batch_ids() {
    let dir = tempdir().unwrap();
    collect_small_corpus(dir.path(), 8);

    let store = VectorStore::open_or_create(store_config(dir.path(), 8)).unwrap();
    assert_eq!(store.cur_idx(), 3);
    assert_eq!(store.token_at(0), 11);
    assert_eq!(store.token_at(1), 12);
    assert_eq!(store.token_at(2), 21);
    // Ids follow batch position, so the masked-out row still consumed
    // an id slot.
    assert_eq!(store.id_at(0), 0);
    assert_eq!(store.id_at(1), 0);
    assert_eq!(store.id_at(2), 1);
}

#[test]
fn id_offset_advances_by_batch_size_across_calls() {
    let dir = tempdir().unwrap();
    let mut engine = save_engine(dir.path(), 32);
    let mut session = RetrievalSession::new();

    let keys = projections(3, 1);
    let values = projections(3, 1);
    // Middle row contributes nothing this step.
    engine
        .save(&mut session, &keys, &values, &[true, false, true], &[1, 2, 3])
        .unwrap();
    engine
        .save(&mut session, &keys, &values, &[true, true, true], &[4, 5, 6])
        .unwrap();
    assert_eq!(session.id_offset(), 6);

    let store = engine.store();
    // First call wrote rows 0 and 2; second call wrote rows 3, 4, 5.
    let ids: Vec<i32> = (0..store.cur_idx()).map(|i| store.id_at(i)).collect();
    assert_eq!(ids, vec![0, 2, 3, 4, 5]);
}

#[test]
fn save_on_retrieve_engine_is_a_config_error() {
    let dir = tempdir().unwrap();
    collect_small_corpus(dir.path(), 8);
    let mut engine = retrieve_engine(dir.path(), 8, RetrievalConfig::default(), None);
    let mut session = RetrievalSession::new();
    let keys = projections(1, 1);
    let values = projections(1, 1);
    assert!(matches!(
        engine.save(&mut session, &keys, &values, &[true], &[1]),
        Err(MnemoError::Config(_))
    ));
}

// ── Retrieve stage: topk policy ─────────────────────────────────────────────

#[test]
fn warm_up_steps_suppress_retrieval() {
    let dir = tempdir().unwrap();
    collect_small_corpus(dir.path(), 8);

    let config = RetrievalConfig {
        topk: 2,
        skip_retrieval_steps: 3,
        ..RetrievalConfig::default()
    };
    let mut engine = retrieve_engine(dir.path(), 8, config, None);
    let mut session = RetrievalSession::new();
    let queries = projections(2, 1);

    // key_length within the warm-up window: zero-width result.
    let out = engine.retrieve(&mut session, &queries, 2, None).unwrap();
    assert_eq!(out.topk(), 0);

    // Past the window: real retrieval.
    let out = engine.retrieve(&mut session, &queries, 4, None).unwrap();
    assert_eq!(out.topk(), 2);
}

#[test]
fn multi_token_calls_disable_retrieval_by_default() {
    let dir = tempdir().unwrap();
    collect_small_corpus(dir.path(), 8);

    let mut engine = retrieve_engine(
        dir.path(),
        8,
        RetrievalConfig {
            topk: 2,
            ..RetrievalConfig::default()
        },
        None,
    );
    let mut session = RetrievalSession::new();
    let queries = projections(2, 3);

    let out = engine.retrieve(&mut session, &queries, 3, None).unwrap();
    assert_eq!(out.topk(), 0);
    assert_eq!(out.rows(), 6);
    // A multi-token call closes the segment: ids advance, cache drops.
    assert_eq!(session.id_offset(), 2);
    assert!(!session.has_cached_lookup());
}

#[test]
fn multi_token_retrieval_flag_enables_similarity_search() {
    let dir = tempdir().unwrap();
    collect_small_corpus(dir.path(), 8);

    let mut engine = retrieve_engine(
        dir.path(),
        8,
        RetrievalConfig {
            topk: 2,
            multi_token_retrieval: true,
            ..RetrievalConfig::default()
        },
        None,
    );
    let mut session = RetrievalSession::new();
    let queries = projections(2, 3);

    let out = engine.retrieve(&mut session, &queries, 3, None).unwrap();
    assert_eq!(out.topk(), 2);
    assert_eq!(out.rows(), 6);
}

// ── Retrieve stage: by-id lookup and caching ────────────────────────────────

#[test]
fn by_id_decode_steps_reuse_the_cached_lookup() {
    let dir = tempdir().unwrap();
    collect_small_corpus(dir.path(), 8);

    let config = RetrievalConfig {
        topk: 2,
        by_ids: true,
        ..RetrievalConfig::default()
    };
    let mut engine = retrieve_engine(dir.path(), 8, config, None);
    let mut session = RetrievalSession::new();
    let queries = projections(2, 1);

    let first = engine.retrieve(&mut session, &queries, 5, None).unwrap();
    assert!(session.has_cached_lookup());
    // Example 0 has two stored entries, example 1 has one (padded).
    assert_eq!(first.topk(), 2);
    assert_eq!(first.key(0, 1, 1), &[0.0; DIM]);

    let second = engine.retrieve(&mut session, &queries, 6, None).unwrap();
    assert_eq!(first, second);
}

#[test]
fn skipped_steps_do_not_seed_the_cache() {
    let dir = tempdir().unwrap();
    collect_small_corpus(dir.path(), 8);

    let config = RetrievalConfig {
        topk: 2,
        by_ids: true,
        skip_retrieval_steps: 2,
        ..RetrievalConfig::default()
    };
    let mut engine = retrieve_engine(dir.path(), 8, config, None);
    let mut session = RetrievalSession::new();
    let queries = projections(2, 1);

    let skipped = engine.retrieve(&mut session, &queries, 1, None).unwrap();
    assert_eq!(skipped.topk(), 0);
    assert!(!session.has_cached_lookup());

    let real = engine.retrieve(&mut session, &queries, 3, None).unwrap();
    assert_eq!(real.topk(), 2);
    assert!(session.has_cached_lookup());
}

#[test]
fn sessions_do_not_share_state() {
    let dir = tempdir().unwrap();
    collect_small_corpus(dir.path(), 8);

    let config = RetrievalConfig {
        topk: 2,
        by_ids: true,
        ..RetrievalConfig::default()
    };
    let mut engine = retrieve_engine(dir.path(), 8, config, None);
    let queries = projections(2, 1);

    let mut a = RetrievalSession::new();
    let mut b = RetrievalSession::new();
    engine.retrieve(&mut a, &queries, 5, None).unwrap();
    assert!(a.has_cached_lookup());
    assert!(!b.has_cached_lookup());

    engine.retrieve(&mut b, &queries, 5, None).unwrap();
    assert_eq!(a.id_offset(), 0);
    assert_eq!(b.id_offset(), 0);
}

// ── Tracking ────────────────────────────────────────────────────────────────

#[test]
fn tracked_decode_steps_are_written_on_flush() {
    let dir = tempdir().unwrap();
    collect_small_corpus(dir.path(), 8);

    let base = dir.path().join("trace");
    let tracker = RetrievalTracker::open(Some(&base), N_HEADS, 2, 99).unwrap();
    let config = RetrievalConfig {
        topk: 2,
        by_ids: true,
        ..RetrievalConfig::default()
    };
    let mut engine = retrieve_engine(dir.path(), 8, config, Some(tracker));
    let mut session = RetrievalSession::new();
    let queries = projections(2, 1);

    engine
        .retrieve(&mut session, &queries, 5, Some(&[11, 21]))
        .unwrap();
    engine
        .retrieve(&mut session, &queries, 6, Some(&[12, 99]))
        .unwrap();
    engine.flush_tracker().unwrap();

    let text =
        std::fs::read_to_string(dir.path().join(format!("trace_h{N_HEADS}_k2.txt"))).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    // Row 0 emits both steps; row 1 stops before its eos prediction.
    assert!(lines[0].starts_with("11 "));
    assert!(lines[1].starts_with("12 "));
    assert_eq!(lines[2], "");
    assert!(lines[3].starts_with("21 "));
    assert_eq!(lines[4], "");
}

#[test]
fn tracking_without_decoder_tokens_fails_fast() {
    let dir = tempdir().unwrap();
    collect_small_corpus(dir.path(), 8);

    let tracker = RetrievalTracker::open(None, N_HEADS, 2, 99).unwrap();
    let config = RetrievalConfig {
        topk: 2,
        by_ids: true,
        ..RetrievalConfig::default()
    };
    let mut engine = retrieve_engine(dir.path(), 8, config, Some(tracker));
    let mut session = RetrievalSession::new();
    let queries = projections(2, 1);

    assert!(matches!(
        engine.retrieve(&mut session, &queries, 5, None),
        Err(MnemoError::Config(_))
    ));
}
