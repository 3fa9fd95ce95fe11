//! Multi-section document generation.
//!
//! Sections are fetched and written strictly one after another, so memory
//! holds at most one section's records. The workbook bytes go into a conduit
//! that an upload drains concurrently.

pub mod xlsx;
pub mod xml;

use std::io::Write;

use crate::model::{BackupJob, ExportedSection};
use crate::source::{RecordSource, SectionSpec};
use crate::transfer::ConduitWriter;
use crate::utils::errors::{ExportError, Result};

pub use xlsx::{SheetSummary, WorkbookWriter};

#[derive(Debug, Default)]
pub struct DocumentSummary {
    pub sheets: Vec<SheetSummary>,
    pub skipped_sections: Vec<&'static str>,
    /// Raw asset references seen in sections that declare an asset field,
    /// only collected when requested.
    pub asset_references: Vec<String>,
}

/// Fetch every section in order and stream the workbook into `sink`.
///
/// On any error the conduit is aborted, so its reader sees a failed stream
/// and no partial document can be stored.
pub async fn build_document(
    source: &dyn RecordSource,
    sections: &'static [SectionSpec],
    job: &BackupJob,
    collect_assets: bool,
    sink: ConduitWriter,
) -> Result<DocumentSummary> {
    let completion = sink.completion();
    let mut book = WorkbookWriter::new(sink);
    // Declared after `book` so it drops first: an early return aborts the
    // conduit before the zip writer's drop tries to write to it.
    let _abort = completion.abort_on_drop();

    let mut summary = DocumentSummary::default();

    for spec in sections {
        let records = source
            .fetch(spec, job.tenant_id, &job.source_connection)
            .await?;
        if records.is_empty() {
            tracing::debug!(tenant_id = job.tenant_id, section = spec.name, "section empty, skipped");
            summary.skipped_sections.push(spec.name);
            continue;
        }

        if collect_assets {
            if let Some(field) = spec.asset_field {
                summary.asset_references.extend(
                    records
                        .iter()
                        .filter_map(|r| r.get(field).and_then(|v| v.as_text()))
                        .map(str::to_string),
                );
            }
        }

        let section = ExportedSection {
            name: spec.name,
            records,
        };
        let (writer, written) = tokio::task::spawn_blocking(move || {
            let result = book.write_sheet(section.name, &section.records);
            drop(section);
            (book, result)
        })
        .await?;
        book = writer;
        let sheet = written?;

        tracing::info!(
            tenant_id = job.tenant_id,
            section = spec.name,
            sheet = %sheet.sheet_name,
            rows = sheet.rows,
            "section written"
        );
        summary.sheets.push(sheet);
    }

    let settle = completion.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut tail = book.finish()?;
        tail.flush()?;
        settle.commit();
        drop(tail);
        Ok(())
    })
    .await??;

    if !completion.is_committed() {
        return Err(ExportError::Document("document stream was aborted".into()));
    }
    Ok(summary)
}
