//! Observability for the indexing store
//!
//! Structured, synchronous logging only; this crate has no metrics or
//! tracing surface.

mod logger;

pub use logger::{Logger, Severity};
