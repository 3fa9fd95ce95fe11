//! The plain-text README stored next to a backup's artifacts.

use chrono::{DateTime, Utc};

use super::destination::{ARCHIVE_NAME, DOCUMENT_NAME};
use crate::model::ArchiveManifest;

/// Render the README. The document size is never included; the archive line
/// only appears when an archive was stored.
pub fn render_manifest(
    tenant_id: i64,
    database: &str,
    generated_at: DateTime<Utc>,
    archive: Option<&ArchiveManifest>,
) -> String {
    let mut out = format!(
        "FULL BACKUP - TENANT {}\nDatabase: {}\nGenerated: {}\n\nFiles:\n- {}\n",
        tenant_id,
        database,
        generated_at.format("%Y-%m-%d %H:%M:%S UTC"),
        DOCUMENT_NAME
    );
    if let Some(manifest) = archive.filter(|m| m.archive_key.is_some()) {
        out.push_str(&format!(
            "- {} ({} of {} images)\n",
            ARCHIVE_NAME, manifest.archived, manifest.total
        ));
    }
    out
}
