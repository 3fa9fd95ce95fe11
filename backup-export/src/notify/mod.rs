//! Requester notification once a backup's artifacts are stored.

pub mod email;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;

use crate::utils::errors::{ExportError, Result};

pub use email::{EmailNotifier, EmailSettings, MailProvider, SmtpSecurity, SmtpSettings};

/// Archive outcome as shown to the requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetSummary {
    pub total: usize,
    pub archived: usize,
    /// Absent when the archive could not be produced.
    pub archive_url: Option<String>,
}

/// Everything a notification needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupNotice {
    pub recipient: String,
    pub tenant_id: i64,
    pub document_url: String,
    pub database_label: String,
    pub assets: Option<AssetSummary>,
    pub generated_at: DateTime<Utc>,
    /// Days the retrieval links stay valid.
    pub valid_for_days: u64,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &BackupNotice) -> Result<()>;
}

/// Keeps every notice in memory. Can be told to fail.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<BackupNotice>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn sent(&self) -> Vec<BackupNotice> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notice: &BackupNotice) -> Result<()> {
        if self.fail {
            return Err(ExportError::Notification("mail relay unreachable".into()));
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(notice.clone());
        }
        Ok(())
    }
}
