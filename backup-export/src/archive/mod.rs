//! Asset archive pipeline: dedupe references, fetch each one, append it to a
//! zip and upload the zip while it is being written.

pub mod writer;

use std::collections::HashSet;

use crate::model::ArchiveManifest;
use crate::storage::{ObjectStore, CONTENT_TYPE_ZIP};
use crate::transfer::{conduit, settle};
use crate::utils::errors::Result;

pub use writer::{AppendOutcome, ArchiveWriter};

/// Where assets come from and where the archive goes.
#[derive(Debug, Clone)]
pub struct ArchiveTarget<'a> {
    pub source_bucket: &'a str,
    pub source_prefix: Option<&'a str>,
    pub bucket: &'a str,
    pub key: &'a str,
}

#[derive(Debug, Clone, Copy)]
pub struct ArchiveSettings {
    pub compression_level: i64,
    pub conduit_capacity: usize,
    pub command_capacity: usize,
    /// Bytes of a single asset held in memory before it spills to disk.
    pub spool_memory_limit: usize,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            compression_level: 9,
            conduit_capacity: 16,
            command_capacity: 16,
            spool_memory_limit: 8 * 1024 * 1024,
        }
    }
}

/// Trim, drop empties and keep the first occurrence of each reference.
pub fn collect_unique_references<I, S>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    raw.into_iter()
        .filter_map(|r| {
            let trimmed = r.as_ref().trim();
            (!trimmed.is_empty() && seen.insert(trimmed.to_string())).then(|| trimmed.to_string())
        })
        .collect()
}

/// Entry names for the archive: the reference's last path segment, or an
/// ordinal placeholder. Repeated names get a `-N` suffix before the extension.
#[derive(Default)]
pub struct EntryNames {
    taken: HashSet<String>,
}

impl EntryNames {
    pub fn assign(&mut self, reference: &str, ordinal: usize) -> String {
        let base = match reference.rsplit('/').next().map(str::trim) {
            Some(segment) if !segment.is_empty() && segment != "." && segment != ".." => {
                segment.to_string()
            }
            _ => format!("asset-{}", ordinal),
        };
        if self.taken.insert(base.clone()) {
            return base;
        }
        let (stem, ext) = match base.rfind('.') {
            Some(dot) if dot > 0 => (&base[..dot], &base[dot..]),
            _ => (base.as_str(), ""),
        };
        let mut n = 2;
        loop {
            let candidate = format!("{}-{}{}", stem, n, ext);
            if self.taken.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}

/// Build and upload the archive for `references` (already deduplicated).
///
/// The upload starts before the first entry is appended. A reference that
/// can't be fetched, or whose stream breaks, is logged and left out of both
/// the archive and the archived count. An error is returned only when the archive itself or its
/// upload fails.
pub async fn archive_assets(
    store: &dyn ObjectStore,
    references: &[String],
    target: &ArchiveTarget<'_>,
    settings: ArchiveSettings,
) -> Result<ArchiveManifest> {
    if references.is_empty() {
        return Ok(ArchiveManifest::default());
    }

    let (sink, body) = conduit(settings.conduit_capacity);
    let upload = store.put_stream(target.bucket, target.key, body, CONTENT_TYPE_ZIP);

    let produce = async {
        let mut writer = ArchiveWriter::spawn(
            sink,
            settings.compression_level,
            settings.command_capacity,
            settings.spool_memory_limit,
        );
        let mut names = EntryNames::default();
        let mut archived = 0usize;
        let mut broken = None;

        for (idx, reference) in references.iter().enumerate() {
            let stream = match store
                .get_stream(target.source_bucket, target.source_prefix, reference)
                .await
            {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(reference = %reference, error = %e, "asset fetch failed, skipping");
                    continue;
                }
            };

            let name = names.assign(reference, idx + 1);
            match writer.append(&name, stream).await {
                Ok(AppendOutcome::Appended { bytes }) => {
                    archived += 1;
                    tracing::debug!(reference = %reference, entry = %name, bytes, "asset archived");
                }
                Ok(AppendOutcome::SourceFailed(e)) => {
                    tracing::warn!(reference = %reference, entry = %name, error = %e, "asset stream broke, skipping");
                }
                Err(e) => {
                    broken = Some(e);
                    break;
                }
            }
        }

        // The actor's own error explains why it stopped taking commands.
        match (writer.finish().await, broken) {
            (Err(e), _) | (Ok(_), Some(e)) => Err(e),
            (Ok(_), None) => Ok(archived),
        }
    };

    let (uploaded, produced) = tokio::join!(upload, produce);
    let (archived, bytes) = settle(produced, uploaded)?;

    tracing::info!(
        key = target.key,
        total = references.len(),
        archived,
        bytes,
        "asset archive uploaded"
    );

    Ok(ArchiveManifest {
        total: references.len(),
        archived,
        archive_key: Some(target.key.to_string()),
    })
}
