//! Event export functionality
//!
//! Writes every lifecycle event the drain loop sees as one JSON object per
//! line, for offline analysis with `jq` or a notebook.

pub mod json_lines;

pub use json_lines::{EventExporter, JsonLinesExporter};
