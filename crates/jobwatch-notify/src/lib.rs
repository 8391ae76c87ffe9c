//! Notification contracts + SMTP delivery of new-posting digests.

use async_trait::async_trait;
use jobwatch_core::HistoryEntry;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use thiserror::Error;
use tracing::info;

pub const CRATE_NAME: &str = "jobwatch-notify";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("{0}")]
    Message(String),
    #[error("invalid mailbox address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("building message: {0}")]
    Build(#[from] lettre::error::Error),
    #[error("smtp delivery failed: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

/// Delivers a digest of newly opened postings. Delivery failure is
/// observable to the pipeline but never rolls back the saved history.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subject: &str, entries: &[HistoryEntry]) -> Result<(), NotifyError>;
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Renders the notification body: one list item per new posting, with the
/// location appended when known.
pub fn render_digest_html(heading: &str, entries: &[HistoryEntry]) -> String {
    let mut body = String::from("<html><body>");
    body.push_str(&format!("<h2>{}</h2>", escape_html(heading)));
    body.push_str("<ul>");
    for entry in entries {
        let link = escape_html(&entry.id);
        body.push_str(&format!(
            "<li><b>{}</b>: <a href=\"{link}\">{link}</a>",
            escape_html(&entry.title)
        ));
        if let Some(location) = &entry.location {
            body.push_str(&format!(" ({})", escape_html(location)));
        }
        body.push_str("</li>");
    }
    body.push_str("</ul>");
    body.push_str("<p><i>Automated message from jobwatch.</i></p>");
    body.push_str("</body></html>");
    body
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    /// 465 (implicit TLS) unless overridden.
    pub port: Option<u16>,
    pub username: String,
    pub password: String,
    pub sender: String,
    pub recipient: String,
}

/// Sends the digest over implicit-TLS SMTP.
pub struct SmtpNotifier {
    config: SmtpConfig,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpNotifier {
    pub fn new(config: SmtpConfig) -> Result<Self, NotifyError> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)?
            .credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        if let Some(port) = config.port {
            builder = builder.port(port);
        }
        Ok(Self {
            transport: builder.build(),
            config,
        })
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn notify(&self, subject: &str, entries: &[HistoryEntry]) -> Result<(), NotifyError> {
        let message = Message::builder()
            .from(self.config.sender.parse::<Mailbox>()?)
            .to(self.config.recipient.parse::<Mailbox>()?)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(render_digest_html(subject, entries))?;

        self.transport.send(message).await?;
        info!(
            recipient = %self.config.recipient,
            entries = entries.len(),
            "notification delivered"
        );
        Ok(())
    }
}

/// Notifier that only logs. Used for dry runs and when no SMTP settings
/// are configured.
#[derive(Debug, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, subject: &str, entries: &[HistoryEntry]) -> Result<(), NotifyError> {
        info!(subject, entries = entries.len(), "notification skipped (no SMTP configured)");
        Ok(())
    }
}
