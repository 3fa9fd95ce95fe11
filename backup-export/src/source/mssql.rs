//! SQL Server section source.
//!
//! Every section opens its own authenticated connection from the job's
//! connection parameters and closes it once the rows are read. `host` may
//! carry a port as `host:port` or in the SQL Server form `host,port`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use std::time::Duration;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, FromSql, Row};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use super::{RecordSource, SectionSpec};
use crate::model::{CellValue, Record, SourceConnection};
use crate::utils::errors::{ExportError, Result};

pub const DEFAULT_PORT: u16 = 1433;

type MssqlClient = Client<Compat<TcpStream>>;

#[derive(Debug, Clone)]
pub struct MssqlSettings {
    /// Require TLS for the whole session, not only the login.
    pub encrypt: bool,
    /// Accept the server certificate without validating it.
    pub trust_cert: bool,
    pub connect_timeout: Duration,
}

impl Default for MssqlSettings {
    fn default() -> Self {
        Self {
            encrypt: false,
            trust_cert: false,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

pub struct MssqlRecordSource {
    settings: MssqlSettings,
}

impl MssqlRecordSource {
    pub fn new(settings: MssqlSettings) -> Self {
        Self { settings }
    }

    pub fn config_for(&self, connection: &SourceConnection) -> Result<Config> {
        let (host, port) = split_host_port(&connection.host)?;
        if connection.database.trim().is_empty() {
            return Err(ExportError::InvalidJob("source database is empty".into()));
        }

        let mut config = Config::new();
        config.host(host);
        config.port(port);
        config.database(connection.database.trim());
        config.authentication(AuthMethod::sql_server(&connection.user, &connection.password));
        config.encryption(if self.settings.encrypt {
            EncryptionLevel::Required
        } else {
            EncryptionLevel::Off
        });
        if self.settings.trust_cert {
            config.trust_cert();
        }
        Ok(config)
    }

    async fn connect(&self, mut config: Config) -> tiberius::Result<MssqlClient> {
        let tcp = TcpStream::connect(config.get_addr()).await?;
        tcp.set_nodelay(true)?;

        match Client::connect(config.clone(), tcp.compat_write()).await {
            // Azure SQL may hand the login over to another node.
            Err(tiberius::error::Error::Routing { host, port }) => {
                tracing::debug!(%host, port, "SQL Server redirected the connection");
                config.host(&host);
                config.port(port);
                let tcp = TcpStream::connect(config.get_addr()).await?;
                tcp.set_nodelay(true)?;
                Client::connect(config, tcp.compat_write()).await
            }
            other => other,
        }
    }
}

#[async_trait]
impl RecordSource for MssqlRecordSource {
    async fn fetch(
        &self,
        section: &SectionSpec,
        tenant_id: i64,
        connection: &SourceConnection,
    ) -> Result<Vec<Record>> {
        let config = self.config_for(connection)?;
        let addr = config.get_addr();

        let mut client = tokio::time::timeout(self.settings.connect_timeout, self.connect(config))
            .await
            .map_err(|_| {
                ExportError::source_failure(section.name, format!("connection to {} timed out", addr))
            })?
            .map_err(|e| ExportError::source_failure(section.name, e))?;

        let result = query_records(&mut client, section.query, tenant_id).await;
        if let Err(e) = client.close().await {
            tracing::debug!(section = section.name, error = %e, "closing source connection failed");
        }

        let records = result.map_err(|e| ExportError::source_failure(section.name, e))?;
        tracing::debug!(section = section.name, tenant_id, rows = records.len(), "section fetched");
        Ok(records)
    }
}

async fn query_records(
    client: &mut MssqlClient,
    query: &str,
    tenant_id: i64,
) -> tiberius::Result<Vec<Record>> {
    let rows = client.query(query, &[&tenant_id]).await?.into_first_result().await?;
    rows.iter().map(to_record).collect()
}

fn to_record(row: &Row) -> tiberius::Result<Record> {
    let mut record = Record::new();
    for (column, data) in row.cells() {
        record.push(column.name(), to_cell(data)?);
    }
    Ok(record)
}

fn to_cell(data: &ColumnData<'static>) -> tiberius::Result<CellValue> {
    let cell = match data {
        ColumnData::U8(v) => v.map(|v| CellValue::Integer(v.into())),
        ColumnData::I16(v) => v.map(|v| CellValue::Integer(v.into())),
        ColumnData::I32(v) => v.map(|v| CellValue::Integer(v.into())),
        ColumnData::I64(v) => v.map(CellValue::Integer),
        ColumnData::F32(v) => v.map(|v| CellValue::Float(v.into())),
        ColumnData::F64(v) => v.map(CellValue::Float),
        ColumnData::Bit(v) => v.map(CellValue::Bool),
        ColumnData::String(v) => v.as_ref().map(|s| CellValue::Text(s.to_string())),
        ColumnData::Guid(v) => v.map(|g| CellValue::Text(g.to_string())),
        ColumnData::Numeric(v) => {
            v.map(|n| CellValue::Float(n.value() as f64 / 10f64.powi(i32::from(n.scale()))))
        }
        ColumnData::Binary(v) => v.as_ref().map(|b| CellValue::Text(format!("[{} bytes]", b.len()))),
        ColumnData::Xml(v) => v.as_ref().map(|x| CellValue::Text(x.clone().into_owned().into_string())),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            NaiveDateTime::from_sql(data)?.map(CellValue::Timestamp)
        }
        ColumnData::Date(_) => NaiveDate::from_sql(data)?
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(CellValue::Timestamp),
        ColumnData::Time(_) => NaiveTime::from_sql(data)?.map(|t| CellValue::Text(t.to_string())),
        ColumnData::DateTimeOffset(_) => {
            DateTime::<Utc>::from_sql(data)?.map(|t| CellValue::Timestamp(t.naive_utc()))
        }
    };
    Ok(cell.unwrap_or(CellValue::Null))
}

fn split_host_port(raw: &str) -> Result<(&str, u16)> {
    let raw = raw.trim();
    let split = raw
        .rsplit_once(',')
        .or_else(|| raw.rsplit_once(':').filter(|(host, _)| !host.contains(':')));

    let (host, port) = match split {
        Some((host, port)) => {
            let port = port.trim().parse::<u16>().map_err(|_| {
                ExportError::InvalidJob(format!("invalid port in source host {:?}", raw))
            })?;
            (host.trim(), port)
        }
        None => (raw, DEFAULT_PORT),
    };

    if host.is_empty() {
        return Err(ExportError::InvalidJob("source host is empty".into()));
    }
    Ok((host, port))
}
