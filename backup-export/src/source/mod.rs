//! Section sources: where exported records come from.

pub mod catalog;
pub mod mssql;
pub mod sqlite;

use async_trait::async_trait;

use crate::model::{Record, SourceConnection};
use crate::utils::errors::Result;

pub use catalog::SECTIONS;
pub use mssql::{MssqlRecordSource, MssqlSettings};
pub use sqlite::SqliteRecordSource;

/// One exported section: a sheet name bound to the query that fills it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionSpec {
    pub name: &'static str,
    pub query: &'static str,
    /// Field holding asset references, for sections that have one.
    pub asset_field: Option<&'static str>,
}

/// Produces the ordered records of one section for one tenant.
///
/// An empty result is valid. Implementations open their own connection per
/// call; nothing is shared between sections of a job.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch(
        &self,
        section: &SectionSpec,
        tenant_id: i64,
        connection: &SourceConnection,
    ) -> Result<Vec<Record>>;
}
