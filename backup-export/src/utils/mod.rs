//! Utility modules shared by the export pipeline.

pub mod errors;
pub mod logger;

pub use errors::{ExportError, Result};
