//! Disk-backed key/value datastore: one store per attention layer,
//! with per-head key/value planes and shared token/id side-channels.

pub mod layout;
mod vector_store;

pub use vector_store::VectorStore;
