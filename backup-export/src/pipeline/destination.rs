//! Destination resolution and the backup folder layout.

use chrono::{DateTime, Utc};

use crate::utils::errors::{ExportError, Result};

pub const DOCUMENT_NAME: &str = "DOCUMENT.xlsx";
pub const MANIFEST_NAME: &str = "README.txt";
pub const ARCHIVE_NAME: &str = "ASSETS.zip";

const FOLDER_TIMESTAMP: &str = "%Y-%m-%dT%H-%M-%S";

/// Bucket and key prefix a job writes into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub bucket: String,
    pub prefix: Option<String>,
}

impl Destination {
    /// `bucket` may embed a prefix after its first `/`. A non-empty
    /// `prefix_override` replaces the embedded prefix entirely.
    pub fn resolve(bucket: &str, prefix_override: Option<&str>) -> Result<Self> {
        let trimmed = bucket.trim().trim_matches('/');
        let (name, embedded) = match trimmed.split_once('/') {
            Some((name, rest)) => (name, Some(rest)),
            None => (trimmed, None),
        };
        if name.is_empty() {
            return Err(ExportError::InvalidJob("destination bucket is empty".into()));
        }

        let clean = |p: &str| {
            let p = p.trim().trim_matches('/');
            (!p.is_empty()).then(|| p.to_string())
        };
        let prefix = prefix_override
            .and_then(clean)
            .or_else(|| embedded.and_then(clean));

        Ok(Self {
            bucket: name.to_string(),
            prefix,
        })
    }

    /// `[<prefix>/]backup-temp/<database>/BACKUP_<tenant>_<timestamp>`
    pub fn backup_folder(&self, database: &str, tenant_id: i64, at: DateTime<Utc>) -> String {
        let name = format!("BACKUP_{}_{}", tenant_id, at.format(FOLDER_TIMESTAMP));
        match &self.prefix {
            Some(prefix) => format!("{}/backup-temp/{}/{}", prefix, database, name),
            None => format!("backup-temp/{}/{}", database, name),
        }
    }
}

pub fn artifact_key(folder: &str, name: &str) -> String {
    format!("{}/{}", folder, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_embedded_prefix() {
        let d = Destination::resolve("b/x", None).unwrap();
        assert_eq!(d.bucket, "b");
        assert_eq!(d.prefix.as_deref(), Some("x"));

        let d = Destination::resolve("b/x/y/", None).unwrap();
        assert_eq!(d.prefix.as_deref(), Some("x/y"));
    }

    #[test]
    fn test_override_replaces_embedded_prefix() {
        let d = Destination::resolve("b/x", Some("y")).unwrap();
        assert_eq!(d.bucket, "b");
        assert_eq!(d.prefix.as_deref(), Some("y"));

        let d = Destination::resolve("b/x", Some("  ")).unwrap();
        assert_eq!(d.prefix.as_deref(), Some("x"));

        let d = Destination::resolve("b", Some("/z/")).unwrap();
        assert_eq!(d.prefix.as_deref(), Some("z"));
    }

    #[test]
    fn test_plain_bucket() {
        let d = Destination::resolve("exports", None).unwrap();
        assert_eq!(d, Destination { bucket: "exports".into(), prefix: None });
        assert!(Destination::resolve("/", None).is_err());
    }

    #[test]
    fn test_backup_folder() {
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap();
        let plain = Destination::resolve("exports", None).unwrap();
        assert_eq!(
            plain.backup_folder("clinic", 21, at),
            "backup-temp/clinic/BACKUP_21_2024-03-05T14-07-09"
        );
        let prefixed = Destination::resolve("exports/acme", None).unwrap();
        assert_eq!(
            prefixed.backup_folder("clinic", 21, at),
            "acme/backup-temp/clinic/BACKUP_21_2024-03-05T14-07-09"
        );
    }
}
