//! Email notifier for finished backups.
//!
//! Supports these delivery providers:
//! - `console`: logs the rendered message (development)
//! - `webhook`: POSTs the message as JSON to a mail relay
//! - `smtp`: delivers a multipart text/HTML message through an SMTP relay
//! - `disabled`: drops the message

use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use serde::Serialize;
use std::fmt;
use tracing::{debug, info};

use super::{BackupNotice, Notifier};
use crate::document::xml::escape;
use crate::utils::errors::{ExportError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpSecurity {
    /// TLS from the first byte, usually port 465.
    Tls,
    /// Plain connection upgraded with STARTTLS when the relay offers it.
    StartTls,
    /// No TLS at all. Only for local test relays.
    Plain,
}

impl SmtpSecurity {
    pub fn parse(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "tls" | "ssl" => Ok(SmtpSecurity::Tls),
            "starttls" | "" => Ok(SmtpSecurity::StartTls),
            "plain" | "none" => Ok(SmtpSecurity::Plain),
            other => Err(ExportError::Config(format!("unknown SMTP security mode: {}", other))),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub security: SmtpSecurity,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl fmt::Debug for SmtpSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("security", &self.security)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailProvider {
    Console,
    Webhook { url: String },
    Smtp(SmtpSettings),
    Disabled,
}

impl MailProvider {
    /// Provider by name. `webhook` needs a relay URL, `smtp` needs relay settings.
    pub fn parse(name: &str, webhook_url: Option<&str>, smtp: Option<SmtpSettings>) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "console" => Ok(MailProvider::Console),
            "disabled" | "none" => Ok(MailProvider::Disabled),
            "smtp" => match smtp.filter(|s| !s.host.trim().is_empty()) {
                Some(settings) => Ok(MailProvider::Smtp(settings)),
                None => Err(ExportError::Config("smtp email provider requires a relay host".into())),
            },
            "webhook" => match webhook_url.map(str::trim).filter(|u| !u.is_empty()) {
                Some(url) => Ok(MailProvider::Webhook {
                    url: url.to_string(),
                }),
                None => Err(ExportError::Config(
                    "webhook email provider requires a relay URL".into(),
                )),
            },
            other => Err(ExportError::Config(format!(
                "unknown email provider: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmailSettings {
    pub provider: MailProvider,
    pub from_address: String,
    pub from_name: String,
}

impl Default for EmailSettings {
    fn default() -> Self {
        Self {
            provider: MailProvider::Console,
            from_address: "backups@localhost".to_string(),
            from_name: "Backup Team".to_string(),
        }
    }
}

/// A rendered message, also the webhook payload.
#[derive(Debug, Clone, Serialize)]
pub struct EmailMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: String,
}

pub struct EmailNotifier {
    settings: EmailSettings,
    client: reqwest::Client,
}

impl EmailNotifier {
    pub fn new(settings: EmailSettings) -> Self {
        Self {
            settings,
            client: reqwest::Client::new(),
        }
    }

    pub fn render(&self, notice: &BackupNotice) -> EmailMessage {
        let from = format!("{} <{}>", self.settings.from_name, self.settings.from_address);
        let subject = format!(
            "Backup complete - tenant {} ({})",
            notice.tenant_id, notice.database_label
        );
        let generated = notice.generated_at.format("%Y-%m-%d %H:%M UTC").to_string();

        let mut text = format!(
            "Hello,\n\n\
             The full backup for tenant #{tenant} is ready.\n\n\
             Database: {db}\n\
             Generated: {generated}\n",
            tenant = notice.tenant_id,
            db = notice.database_label,
            generated = generated,
        );
        if let Some(assets) = &notice.assets {
            text.push_str(&format!("Images: {}/{}\n", assets.archived, assets.total));
        }
        text.push_str(&format!("\nDownload the workbook:\n{}\n", notice.document_url));
        if let Some(url) = notice.assets.as_ref().and_then(|a| a.archive_url.as_ref()) {
            text.push_str(&format!("\nDownload the image archive:\n{}\n", url));
        }
        text.push_str(&format!(
            "\nThese links are valid for {} days. Download the files and keep them somewhere safe.\n\n\
             This is an automated message, please do not reply.\n\n{}\n",
            notice.valid_for_days, self.settings.from_name
        ));

        let html = self.render_html(notice, &generated);

        EmailMessage {
            from,
            to: notice.recipient.clone(),
            subject,
            text,
            html,
        }
    }

    fn render_html(&self, notice: &BackupNotice, generated: &str) -> String {
        let detail = |label: &str, value: &str| {
            format!(
                r#"<div style="background: #fff; padding: 10px; border: 1px solid #e0e0e0; border-radius: 4px;"><strong style="display: block; color: #666; font-size: 12px; text-transform: uppercase;">{}</strong><span style="color: #333; font-size: 16px; font-weight: 600;">{}</span></div>"#,
                label,
                escape(value)
            )
        };
        let button = |href: &str, label: &str, color: &str| {
            format!(
                r#"<div style="text-align: center; margin: 24px 0 0 0;"><a href="{}" style="display: inline-block; background: {}; color: #fff; padding: 15px 38px; text-decoration: none; border-radius: 7px; font-weight: 700;">{}</a></div>"#,
                escape(href),
                color,
                label
            )
        };

        let mut details = vec![
            detail("Tenant", &format!("#{}", notice.tenant_id)),
            detail("Database", &notice.database_label),
            detail("Generated", generated),
        ];
        let mut buttons = vec![button(&notice.document_url, "Download backup", "#4472C4")];
        if let Some(assets) = &notice.assets {
            details.push(detail(
                "Images",
                &format!("{}/{}", assets.archived, assets.total),
            ));
            if let Some(url) = &assets.archive_url {
                buttons.push(button(url, "Download images", "#28a745"));
            }
        }

        format!(
            r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Backup complete</title>
</head>
<body style="font-family: Arial, sans-serif; background: #f4f4f4; margin: 0; padding: 0;">
    <div style="max-width: 650px; margin: 30px auto; background: #fff; border-radius: 10px; overflow: hidden;">
        <div style="background: #4472C4; color: #fff; padding: 32px 20px 18px 20px; text-align: center;">
            <h1 style="margin: 0; font-size: 28px;">Backup complete</h1>
            <p style="margin: 10px 0 0 0; font-size: 15px;">Your data is ready to download</p>
        </div>
        <div style="padding: 38px 30px;">
            <p>Hello,</p>
            <p>The full backup for your account has been generated.</p>
            <div style="background: #f0f7ff; border-left: 4px solid #4472C4; padding: 18px; margin: 22px 0; border-radius: 5px;">
                <h3 style="margin: 0 0 13px 0; color: #4472C4;">Backup details</h3>
                <div style="display: grid; grid-template-columns: 1fr 1fr; gap: 13px;">
                    {details}
                </div>
                <p style="margin: 15px 0 0 0; font-size: 14px; color: #666;">Format: Excel workbook (.xlsx), one sheet per section</p>
            </div>
            {buttons}
            <div style="background: #fff9e6; border-left: 4px solid #ffc107; padding: 13px; margin: 22px 0; border-radius: 4px;">
                <p style="margin: 0; font-size: 14px; color: #856404;"><strong>Important:</strong> these links are valid for {days} days. Download the files and keep them somewhere safe.</p>
            </div>
        </div>
        <div style="background: #f9f9f9; padding: 22px 30px; text-align: center; border-top: 1px solid #e0e0e0;">
            <p style="margin: 5px 0; font-size: 13px; color: #666;"><strong>{team}</strong></p>
            <p style="margin-top: 15px; font-size: 12px; color: #999;">This is an automated message, please do not reply.</p>
        </div>
    </div>
</body>
</html>"#,
            details = details.join("\n                    "),
            buttons = buttons.join("\n            "),
            days = notice.valid_for_days,
            team = escape(&self.settings.from_name),
        )
    }

    async fn send_console(&self, message: &EmailMessage) -> Result<()> {
        info!(
            to = %message.to,
            from = %message.from,
            subject = %message.subject,
            "backup notification (console provider)"
        );
        debug!(body = %message.text, "notification body");
        Ok(())
    }

    async fn send_webhook(&self, url: &str, message: &EmailMessage) -> Result<()> {
        let response = self
            .client
            .post(url)
            .json(message)
            .send()
            .await
            .map_err(|e| ExportError::Notification(format!("mail relay request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ExportError::Notification(format!(
                "mail relay returned {}: {}",
                status, body
            )));
        }

        info!(to = %message.to, subject = %message.subject, "backup notification sent");
        Ok(())
    }

    async fn send_smtp(&self, smtp: &SmtpSettings, message: &EmailMessage) -> Result<()> {
        let email = build_mime(message)?;
        let transport = smtp_transport(smtp)?;
        let response = transport.send(email).await.map_err(|e| {
            ExportError::Notification(format!("SMTP delivery via {} failed: {}", smtp.host, e))
        })?;

        info!(
            to = %message.to,
            subject = %message.subject,
            relay = %smtp.host,
            code = %response.code(),
            "backup notification sent"
        );
        Ok(())
    }
}

fn build_mime(message: &EmailMessage) -> Result<lettre::Message> {
    let from: Mailbox = message
        .from
        .parse()
        .map_err(|e| ExportError::Notification(format!("invalid sender {:?}: {}", message.from, e)))?;
    let to: Mailbox = message
        .to
        .parse()
        .map_err(|e| ExportError::Notification(format!("invalid recipient {:?}: {}", message.to, e)))?;

    lettre::Message::builder()
        .from(from)
        .to(to)
        .subject(message.subject.clone())
        .multipart(MultiPart::alternative_plain_html(
            message.text.clone(),
            message.html.clone(),
        ))
        .map_err(|e| ExportError::Notification(format!("could not build message: {}", e)))
}

fn smtp_transport(smtp: &SmtpSettings) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
    let builder = match smtp.security {
        SmtpSecurity::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp.host),
        SmtpSecurity::StartTls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp.host),
        SmtpSecurity::Plain => Ok(AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(
            smtp.host.as_str(),
        )),
    }
    .map_err(|e| ExportError::Notification(format!("invalid SMTP relay {}: {}", smtp.host, e)))?;

    let mut builder = builder.port(smtp.port);
    if let (Some(user), Some(password)) = (&smtp.username, &smtp.password) {
        builder = builder.credentials(Credentials::new(user.clone(), password.clone()));
    }
    Ok(builder.build())
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn notify(&self, notice: &BackupNotice) -> Result<()> {
        if self.settings.provider == MailProvider::Disabled {
            debug!(to = %notice.recipient, "email disabled, skipping notification");
            return Ok(());
        }

        let message = self.render(notice);
        match &self.settings.provider {
            MailProvider::Console => self.send_console(&message).await,
            MailProvider::Webhook { url } => self.send_webhook(url, &message).await,
            MailProvider::Smtp(smtp) => self.send_smtp(smtp, &message).await,
            MailProvider::Disabled => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::AssetSummary;
    use chrono::TimeZone;

    fn notice(assets: Option<AssetSummary>) -> BackupNotice {
        BackupNotice {
            recipient: "owner@clinic.test".into(),
            tenant_id: 21,
            document_url: "https://files.test/doc?sig=a&b=c".into(),
            database_label: "clinic_main".into(),
            assets,
            generated_at: chrono::Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 0).unwrap(),
            valid_for_days: 7,
        }
    }

    fn local_relay(port: u16) -> SmtpSettings {
        SmtpSettings {
            host: "127.0.0.1".into(),
            port,
            security: SmtpSecurity::Plain,
            username: Some("mailer".into()),
            password: Some("relay-secret".into()),
        }
    }

    #[test]
    fn test_provider_parse() {
        assert_eq!(MailProvider::parse("Console", None, None).unwrap(), MailProvider::Console);
        assert_eq!(MailProvider::parse("disabled", None, None).unwrap(), MailProvider::Disabled);
        assert_eq!(
            MailProvider::parse("webhook", Some("http://relay/send"), None).unwrap(),
            MailProvider::Webhook { url: "http://relay/send".into() }
        );
        assert!(MailProvider::parse("webhook", Some("  "), None).is_err());
        assert!(MailProvider::parse("smtp", None, None).is_err());
        assert_eq!(
            MailProvider::parse("SMTP", None, Some(local_relay(25))).unwrap(),
            MailProvider::Smtp(local_relay(25))
        );
        assert!(MailProvider::parse("carrier-pigeon", None, None).is_err());
    }

    #[test]
    fn test_smtp_security_names() {
        assert_eq!(SmtpSecurity::parse("STARTTLS").unwrap(), SmtpSecurity::StartTls);
        assert_eq!(SmtpSecurity::parse("").unwrap(), SmtpSecurity::StartTls);
        assert_eq!(SmtpSecurity::parse("ssl").unwrap(), SmtpSecurity::Tls);
        assert_eq!(SmtpSecurity::parse("none").unwrap(), SmtpSecurity::Plain);
        assert!(SmtpSecurity::parse("maybe").is_err());
    }

    #[test]
    fn test_smtp_debug_hides_password() {
        let printed = format!("{:?}", local_relay(25));
        assert!(printed.contains("mailer"));
        assert!(!printed.contains("relay-secret"));
    }

    #[test]
    fn test_mime_message_carries_both_bodies() {
        let notifier = EmailNotifier::new(EmailSettings::default());
        let email = build_mime(&notifier.render(&notice(None))).unwrap();
        let raw = String::from_utf8(email.formatted()).unwrap();

        assert!(raw.contains("Subject: Backup complete - tenant 21 (clinic_main)"));
        assert!(raw.contains("To: owner@clinic.test"));
        assert!(raw.contains("multipart/alternative"));
        assert!(raw.contains("text/plain"));
        assert!(raw.contains("text/html"));
    }

    #[test]
    fn test_invalid_recipient_is_a_notification_error() {
        let notifier = EmailNotifier::new(EmailSettings::default());
        let mut message = notifier.render(&notice(None));
        message.to = "not an address".into();
        assert!(matches!(build_mime(&message), Err(ExportError::Notification(_))));
    }

    #[tokio::test]
    async fn test_unreachable_smtp_relay_is_a_notification_error() {
        let notifier = EmailNotifier::new(EmailSettings {
            provider: MailProvider::Smtp(local_relay(9)),
            ..EmailSettings::default()
        });
        let err = notifier.notify(&notice(None)).await.unwrap_err();
        assert!(matches!(err, ExportError::Notification(_)));
    }

    #[test]
    fn test_render_document_only() {
        let notifier = EmailNotifier::new(EmailSettings::default());
        let msg = notifier.render(&notice(None));

        assert_eq!(msg.to, "owner@clinic.test");
        assert_eq!(msg.subject, "Backup complete - tenant 21 (clinic_main)");
        assert!(msg.text.contains("https://files.test/doc?sig=a&b=c"));
        assert!(msg.text.contains("2024-03-05 14:07 UTC"));
        assert!(msg.text.contains("valid for 7 days"));
        assert!(!msg.text.contains("Images"));
        assert!(msg.html.contains("https://files.test/doc?sig=a&amp;b=c"));
        assert!(!msg.html.contains("Download images"));
    }

    #[test]
    fn test_render_with_assets() {
        let notifier = EmailNotifier::new(EmailSettings::default());
        let msg = notifier.render(&notice(Some(AssetSummary {
            total: 4,
            archived: 3,
            archive_url: Some("https://files.test/zip".into()),
        })));

        assert!(msg.text.contains("Images: 3/4"));
        assert!(msg.text.contains("https://files.test/zip"));
        assert!(msg.html.contains("3/4"));
        assert!(msg.html.contains("Download images"));
    }

    #[tokio::test]
    async fn test_disabled_and_console_succeed() {
        for provider in [MailProvider::Disabled, MailProvider::Console] {
            let notifier = EmailNotifier::new(EmailSettings {
                provider,
                ..EmailSettings::default()
            });
            notifier.notify(&notice(None)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_unreachable_relay_is_a_notification_error() {
        let notifier = EmailNotifier::new(EmailSettings {
            provider: MailProvider::Webhook {
                url: "http://127.0.0.1:9/send".into(),
            },
            ..EmailSettings::default()
        });
        let err = notifier.notify(&notice(None)).await.unwrap_err();
        assert!(matches!(err, ExportError::Notification(_)));
    }
}
