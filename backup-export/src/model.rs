//! Data model shared by the intake boundary, the job ledger and the pipeline.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::utils::errors::{ExportError, Result};

/// Connection parameters for the tenant's data source.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceConnection {
    pub host: String,
    pub database: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

impl fmt::Debug for SourceConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConnection")
            .field("host", &self.host)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// One export request. Immutable once enqueued; this is also the queue message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackupJob {
    pub tenant_id: i64,
    pub recipient_email: String,
    pub source_connection: SourceConnection,
    pub destination_bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_prefix: Option<String>,
    #[serde(default)]
    pub include_assets: bool,
}

impl BackupJob {
    pub fn validate(&self) -> Result<()> {
        if self.tenant_id <= 0 {
            return Err(ExportError::InvalidJob(
                "tenantId must be a positive integer".into(),
            ));
        }
        let email = self.recipient_email.trim();
        if email.is_empty() || !email.contains('@') || email.starts_with('@') || email.ends_with('@')
        {
            return Err(ExportError::InvalidJob(
                "recipientEmail must be a valid address".into(),
            ));
        }
        if self.destination_bucket.trim().trim_matches('/').is_empty() {
            return Err(ExportError::InvalidJob(
                "destinationBucket is required".into(),
            ));
        }
        let db = self.source_connection.database.trim();
        if db.is_empty() {
            return Err(ExportError::InvalidJob(
                "sourceConnection.database is required".into(),
            ));
        }
        if db.contains('/') || db.contains('\\') || db == "." || db == ".." {
            return Err(ExportError::InvalidJob(
                "sourceConnection.database must be a plain name".into(),
            ));
        }
        if self.source_connection.host.trim().is_empty() {
            return Err(ExportError::InvalidJob(
                "sourceConnection.host is required".into(),
            ));
        }
        Ok(())
    }
}

/// Scalar value of one record field.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Timestamp(NaiveDateTime),
}

impl CellValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            CellValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for CellValue {
    fn from(v: &str) -> Self {
        CellValue::Text(v.to_string())
    }
}

impl From<String> for CellValue {
    fn from(v: String) -> Self {
        CellValue::Text(v)
    }
}

impl From<i64> for CellValue {
    fn from(v: i64) -> Self {
        CellValue::Integer(v)
    }
}

impl From<f64> for CellValue {
    fn from(v: f64) -> Self {
        CellValue::Float(v)
    }
}

impl From<bool> for CellValue {
    fn from(v: bool) -> Self {
        CellValue::Bool(v)
    }
}

impl From<NaiveDateTime> for CellValue {
    fn from(v: NaiveDateTime) -> Self {
        CellValue::Timestamp(v)
    }
}

impl<T: Into<CellValue>> From<Option<T>> for CellValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(CellValue::Null)
    }
}

/// An ordered field name -> value mapping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Vec<(String, CellValue)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<CellValue>) -> Self {
        self.push(name, value);
        self
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<CellValue>) {
        self.fields.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&CellValue> {
        self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &CellValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Records of one section, released right after being written.
#[derive(Debug, Clone)]
pub struct ExportedSection {
    pub name: &'static str,
    pub records: Vec<Record>,
}

/// Outcome of the asset archive step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveManifest {
    pub total: usize,
    pub archived: usize,
    pub archive_key: Option<String>,
}

/// The stored outputs of one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupArtifacts {
    pub bucket: String,
    pub folder: String,
    pub document_key: String,
    pub document_url: String,
    pub manifest_key: String,
    pub archive: Option<ArchiveManifest>,
    pub archive_url: Option<String>,
}
