//! HNSW vector index: persistent multi-layer proximity graph over 64 KiB
//! node pages, with cosine distance over normalized vectors.

pub mod distance;
pub mod graph;
pub mod node;

pub use graph::{HnswIndex, HnswParams, MAX_DIM};
