//! SQLite-backed section source.
//!
//! Each tenant database is a file `<root>/<database>.db`. `host`, `user` and
//! `password` from the connection parameters are not used by this backend.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OpenFlags};
use std::path::{Path, PathBuf};

use super::{RecordSource, SectionSpec};
use crate::model::{CellValue, Record, SourceConnection};
use crate::utils::errors::{ExportError, Result};

const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"];

pub struct SqliteRecordSource {
    root: PathBuf,
}

impl SqliteRecordSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn database_path(&self, connection: &SourceConnection) -> Result<PathBuf> {
        let name = connection.database.trim();
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(ExportError::InvalidJob(format!(
                "invalid database name: {:?}",
                connection.database
            )));
        }
        Ok(self.root.join(format!("{}.db", name)))
    }
}

#[async_trait]
impl RecordSource for SqliteRecordSource {
    async fn fetch(
        &self,
        section: &SectionSpec,
        tenant_id: i64,
        connection: &SourceConnection,
    ) -> Result<Vec<Record>> {
        let path = self.database_path(connection)?;
        let query = section.query;
        let name = section.name;

        let records = tokio::task::spawn_blocking(move || run_section_query(&path, query, tenant_id))
            .await?
            .map_err(|e| ExportError::source_failure(name, e))?;

        tracing::debug!(section = name, tenant_id, rows = records.len(), "section fetched");
        Ok(records)
    }
}

/// Open a fresh read-only connection, run one query, close.
fn run_section_query(path: &Path, query: &str, tenant_id: i64) -> rusqlite::Result<Vec<Record>> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    let mut stmt = conn.prepare(query)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    let mut records = Vec::new();
    let mut rows = stmt.query(params![tenant_id])?;
    while let Some(row) = rows.next()? {
        let mut record = Record::new();
        for (idx, column) in columns.iter().enumerate() {
            record.push(column.clone(), to_cell(row.get_ref(idx)?));
        }
        records.push(record);
    }
    Ok(records)
}

fn to_cell(value: ValueRef<'_>) -> CellValue {
    match value {
        ValueRef::Null => CellValue::Null,
        ValueRef::Integer(i) => CellValue::Integer(i),
        ValueRef::Real(f) => CellValue::Float(f),
        ValueRef::Text(raw) => {
            let text = String::from_utf8_lossy(raw);
            match parse_timestamp(&text) {
                Some(ts) => CellValue::Timestamp(ts),
                None => CellValue::Text(text.into_owned()),
            }
        }
        ValueRef::Blob(raw) => CellValue::Text(format!("[{} bytes]", raw.len())),
    }
}

fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    if text.len() < 10 || !text.as_bytes()[0].is_ascii_digit() {
        return None;
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}
