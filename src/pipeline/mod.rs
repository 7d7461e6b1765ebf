//! Pipeline stages built on the guard layer.

mod ingest;

pub use ingest::*;
