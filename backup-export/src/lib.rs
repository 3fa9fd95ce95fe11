//! Streaming tenant export pipeline.
//!
//! A job reads every section of a tenant's records into one XLSX workbook
//! that is uploaded while it is written, optionally bundles the referenced
//! images into a zip archive the same way, stores a README next to both and
//! tells the requester where to download them.

pub mod archive;
pub mod document;
pub mod model;
pub mod notify;
pub mod pipeline;
pub mod source;
pub mod storage;
pub mod transfer;
pub mod utils;

pub use model::{ArchiveManifest, BackupArtifacts, BackupJob, CellValue, Record, SourceConnection};
pub use pipeline::{BackupPipeline, BackupReport, PipelineConfig};
pub use utils::errors::{ExportError, Result};
