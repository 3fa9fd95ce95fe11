use anyhow::Context;
use backup_export::notify::{EmailSettings, MailProvider, SmtpSecurity, SmtpSettings};
use backup_export::pipeline::{PipelineConfig, DEFAULT_URL_TTL};
use backup_export::source::{MssqlRecordSource, MssqlSettings, RecordSource, SqliteRecordSource};
use backup_export::storage::S3Settings;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// Local directory tree served by this process (development)
    Local,
    S3,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(StorageBackend::Local),
            "s3" => Ok(StorageBackend::S3),
            other => anyhow::bail!("unknown storage backend: {}", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceBackend {
    /// One SQLite file per tenant database (development)
    Sqlite,
    Mssql,
}

impl FromStr for SourceBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(SourceBackend::Sqlite),
            "mssql" | "sqlserver" => Ok(SourceBackend::Mssql),
            other => anyhow::bail!("unknown source backend: {}", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub storage_backend: StorageBackend,
    /// Root of the local object store; buckets are its subdirectories.
    pub storage_root: PathBuf,
    pub s3_region: String,
    pub s3_endpoint: Option<String>,
    pub s3_access_key_id: Option<String>,
    pub s3_secret_access_key: Option<String>,
    pub s3_force_path_style: bool,
    pub source_backend: SourceBackend,
    /// Directory holding one SQLite file per tenant database.
    pub sources_root: PathBuf,
    pub mssql_encrypt: bool,
    pub mssql_trust_cert: bool,
    /// Base of issued retrieval URLs.
    pub public_base_url: String,
    pub intake_api_key: String,
    pub url_signing_secret: String,
    pub url_ttl_secs: u64,
    pub poll_interval_secs: u64,
    pub stale_lease_secs: u64,
    pub worker_id: String,
    pub email_provider: String,
    pub email_webhook_url: Option<String>,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_security: String,
    pub smtp_user: Option<String>,
    pub smtp_password: Option<String>,
    pub email_from_address: String,
    pub email_from_name: String,
    pub log_level: String,
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.into())
}

fn parsed_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn required(name: &str) -> anyhow::Result<String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .with_context(|| format!("{} must be set", name))
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let data_dir = PathBuf::from(var_or("DATA_DIR", "./data"));
        let port = parsed_or("PORT", 3000u16);

        Ok(Self {
            port,
            db_path: data_dir.join("export-jobs.db"),
            storage_backend: var_or("STORAGE_BACKEND", "local").parse()?,
            storage_root: std::env::var("STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("objects")),
            s3_region: optional("S3_REGION")
                .or_else(|| optional("AWS_REGION"))
                .unwrap_or_else(|| "us-east-1".into()),
            s3_endpoint: optional("S3_ENDPOINT"),
            s3_access_key_id: optional("AWS_ACCESS_KEY_ID"),
            s3_secret_access_key: optional("AWS_SECRET_ACCESS_KEY"),
            s3_force_path_style: flag("S3_FORCE_PATH_STYLE", false),
            source_backend: var_or("SOURCE_BACKEND", "sqlite").parse()?,
            sources_root: std::env::var("SOURCES_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("sources")),
            mssql_encrypt: flag("DB_ENCRYPT", false),
            mssql_trust_cert: flag("DB_TRUST_CERT", false),
            data_dir,
            public_base_url: var_or("PUBLIC_BASE_URL", &format!("http://localhost:{}", port)),
            intake_api_key: required("INTAKE_API_KEY")?,
            url_signing_secret: required("URL_SIGNING_SECRET")?,
            url_ttl_secs: parsed_or("URL_TTL_SECS", DEFAULT_URL_TTL.as_secs()),
            poll_interval_secs: parsed_or("QUEUE_POLL_INTERVAL_SECS", 5),
            stale_lease_secs: parsed_or("STALE_LEASE_SECS", 6 * 3600),
            worker_id: std::env::var("WORKER_ID")
                .unwrap_or_else(|_| format!("worker-{}", std::process::id())),
            email_provider: var_or("EMAIL_PROVIDER", "console"),
            email_webhook_url: std::env::var("EMAIL_WEBHOOK_URL").ok(),
            smtp_host: var_or("SMTP_HOST", "email-smtp.us-east-1.amazonaws.com"),
            smtp_port: parsed_or("SMTP_PORT", 587),
            smtp_security: var_or("SMTP_SECURITY", "starttls"),
            smtp_user: optional("SMTP_USER"),
            smtp_password: optional("SMTP_PASS"),
            email_from_address: var_or("EMAIL_FROM_ADDRESS", "backups@localhost"),
            email_from_name: var_or("EMAIL_FROM_NAME", "Backup Team"),
            log_level: var_or("LOG_LEVEL", "info"),
        })
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            url_ttl: Duration::from_secs(self.url_ttl_secs),
            ..PipelineConfig::default()
        }
    }

    pub fn s3_settings(&self) -> S3Settings {
        S3Settings {
            region: self.s3_region.clone(),
            endpoint: self.s3_endpoint.clone(),
            access_key_id: self.s3_access_key_id.clone(),
            secret_access_key: self.s3_secret_access_key.clone(),
            force_path_style: self.s3_force_path_style,
            ..S3Settings::default()
        }
    }

    pub fn record_source(&self) -> Arc<dyn RecordSource> {
        match self.source_backend {
            SourceBackend::Sqlite => Arc::new(SqliteRecordSource::new(&self.sources_root)),
            SourceBackend::Mssql => Arc::new(MssqlRecordSource::new(MssqlSettings {
                encrypt: self.mssql_encrypt,
                trust_cert: self.mssql_trust_cert,
                ..MssqlSettings::default()
            })),
        }
    }

    pub fn smtp_settings(&self) -> anyhow::Result<SmtpSettings> {
        Ok(SmtpSettings {
            host: self.smtp_host.clone(),
            port: self.smtp_port,
            security: SmtpSecurity::parse(&self.smtp_security)?,
            username: self.smtp_user.clone(),
            password: self.smtp_password.clone(),
        })
    }

    pub fn email_settings(&self) -> anyhow::Result<EmailSettings> {
        let provider = MailProvider::parse(
            &self.email_provider,
            self.email_webhook_url.as_deref(),
            Some(self.smtp_settings()?),
        )?;
        Ok(EmailSettings {
            provider,
            from_address: self.email_from_address.clone(),
            from_name: self.email_from_name.clone(),
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn stale_lease(&self) -> Duration {
        Duration::from_secs(self.stale_lease_secs)
    }
}

#[cfg(test)]
impl AppConfig {
    /// Config rooted in a scratch directory.
    pub fn for_tests(root: &std::path::Path) -> Self {
        Self {
            port: 0,
            data_dir: root.to_path_buf(),
            db_path: root.join("export-jobs.db"),
            storage_backend: StorageBackend::Local,
            storage_root: root.join("objects"),
            s3_region: "us-east-1".into(),
            s3_endpoint: None,
            s3_access_key_id: None,
            s3_secret_access_key: None,
            s3_force_path_style: false,
            source_backend: SourceBackend::Sqlite,
            sources_root: root.join("sources"),
            mssql_encrypt: false,
            mssql_trust_cert: false,
            public_base_url: "http://localhost:3000".into(),
            intake_api_key: "intake-key".into(),
            url_signing_secret: "signing-secret".into(),
            url_ttl_secs: 604_800,
            poll_interval_secs: 1,
            stale_lease_secs: 3600,
            worker_id: "test-worker".into(),
            email_provider: "disabled".into(),
            email_webhook_url: None,
            smtp_host: "127.0.0.1".into(),
            smtp_port: 2525,
            smtp_security: "plain".into(),
            smtp_user: None,
            smtp_password: None,
            email_from_address: "backups@localhost".into(),
            email_from_name: "Backup Team".into(),
            log_level: "debug".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_settings() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::for_tests(dir.path());
        assert_eq!(config.pipeline_config().url_ttl.as_secs(), 604_800);
        assert_eq!(config.email_settings().unwrap().provider, MailProvider::Disabled);

        let mut bad = config.clone();
        bad.email_provider = "webhook".into();
        assert!(bad.email_settings().is_err());
    }

    #[test]
    fn test_backend_names() {
        assert_eq!("S3".parse::<StorageBackend>().unwrap(), StorageBackend::S3);
        assert_eq!("local".parse::<StorageBackend>().unwrap(), StorageBackend::Local);
        assert!("gcs".parse::<StorageBackend>().is_err());
        assert_eq!("mssql".parse::<SourceBackend>().unwrap(), SourceBackend::Mssql);
        assert_eq!("sqlite".parse::<SourceBackend>().unwrap(), SourceBackend::Sqlite);
        assert!("oracle".parse::<SourceBackend>().is_err());
    }

    #[test]
    fn test_s3_settings_follow_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::for_tests(dir.path());
        config.s3_region = "sa-east-1".into();
        config.s3_endpoint = Some("http://minio:9000".into());
        config.s3_force_path_style = true;

        let settings = config.s3_settings();
        assert_eq!(settings.region, "sa-east-1");
        assert_eq!(settings.endpoint.as_deref(), Some("http://minio:9000"));
        assert!(settings.force_path_style);
        assert!(settings.access_key_id.is_none());
    }

    #[test]
    fn test_smtp_provider_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::for_tests(dir.path());
        config.email_provider = "smtp".into();
        config.smtp_user = Some("mailer".into());
        config.smtp_password = Some("secret".into());

        match config.email_settings().unwrap().provider {
            MailProvider::Smtp(smtp) => {
                assert_eq!(smtp.host, "127.0.0.1");
                assert_eq!(smtp.port, 2525);
                assert_eq!(smtp.security, SmtpSecurity::Plain);
                assert_eq!(smtp.username.as_deref(), Some("mailer"));
            }
            other => panic!("unexpected provider {:?}", other),
        }

        config.smtp_security = "carrier-pigeon".into();
        assert!(config.email_settings().is_err());
    }
}
