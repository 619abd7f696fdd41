//! Full-text BM25 index over tool name+description, segmented by upstream
//! server prefix and rebuildable from storage at startup.

pub mod bm25;
pub mod index;
pub mod tokenizer;

pub use index::{SearchResult, ToolIndex, DEFAULT_LIMIT};
