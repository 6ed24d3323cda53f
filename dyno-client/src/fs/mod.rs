//! File system helpers: directory walking and per-file metadata.

pub mod metadata;
pub mod walker;
