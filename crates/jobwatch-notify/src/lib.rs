//! Digest delivery: SMTP email rendered from a minijinja template.

use async_trait::async_trait;
use jobwatch_engine::Digest;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use minijinja::Environment;
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "jobwatch-notify";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("smtp delivery failed: {0}")]
    Smtp(String),

    #[error("template rendering failed: {0}")]
    Template(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// A notification channel. Implementations deliver a digest as one message
/// and must not retry internally.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, digest: &Digest) -> Result<(), NotifyError>;

    /// Delivers a fixed probe message so the channel can be verified
    /// without waiting for new postings.
    async fn probe(&self) -> Result<(), NotifyError>;

    fn channel_name(&self) -> &str;
}

/// SMTP edge configuration.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub from: String,
    pub to: Vec<String>,
}

impl EmailConfig {
    /// Reads the mail edge from the environment. `EMAIL_FROM` and
    /// `NOTIFY_EMAIL` are required; `NOTIFY_EMAIL` accepts a comma-separated
    /// list. Host and port default to `smtp.gmail.com:587`.
    pub fn from_env() -> Result<Self, NotifyError> {
        let from = std::env::var("EMAIL_FROM")
            .map_err(|_| NotifyError::Config("EMAIL_FROM is not set".to_string()))?;
        let to_raw = std::env::var("NOTIFY_EMAIL")
            .map_err(|_| NotifyError::Config("NOTIFY_EMAIL is not set".to_string()))?;
        let to: Vec<String> = to_raw
            .split(',')
            .map(|addr| addr.trim().to_string())
            .filter(|addr| !addr.is_empty())
            .collect();
        let smtp_host =
            std::env::var("SMTP_HOST").unwrap_or_else(|_| "smtp.gmail.com".to_string());
        let smtp_port = std::env::var("SMTP_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(587);
        Ok(Self {
            smtp_host,
            smtp_port,
            from,
            to,
        })
    }
}

/// Sends the digest as an HTML email over SMTP with STARTTLS.
#[derive(Debug)]
pub struct EmailNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl EmailNotifier {
    /// Builds the notifier, validating every address up front. Credentials
    /// are taken from `SMTP_USERNAME`/`SMTP_PASSWORD` when both are set;
    /// otherwise the connection is unauthenticated.
    pub fn from_config(config: &EmailConfig) -> Result<Self, NotifyError> {
        let from: Mailbox = config
            .from
            .parse()
            .map_err(|e: lettre::address::AddressError| NotifyError::Config(e.to_string()))?;

        let to: Vec<Mailbox> = config
            .to
            .iter()
            .map(|addr| {
                addr.parse().map_err(|e: lettre::address::AddressError| {
                    NotifyError::Config(format!("{addr}: {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        if to.is_empty() {
            return Err(NotifyError::Config(
                "at least one recipient is required".to_string(),
            ));
        }

        let mut builder =
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
                .map_err(|e| NotifyError::Config(e.to_string()))?
                .port(config.smtp_port);
        if let (Ok(username), Ok(password)) =
            (std::env::var("SMTP_USERNAME"), std::env::var("SMTP_PASSWORD"))
        {
            builder = builder.credentials(Credentials::new(username, password));
        }

        Ok(Self {
            transport: builder.build(),
            from,
            to,
        })
    }

    fn message(&self, subject: &str, html: String) -> Result<Message, NotifyError> {
        let mut builder = Message::builder().from(self.from.clone());
        for recipient in &self.to {
            builder = builder.to(recipient.clone());
        }
        builder
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(html)
            .map_err(|e| NotifyError::Smtp(e.to_string()))
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn send(&self, digest: &Digest) -> Result<(), NotifyError> {
        if digest.is_empty() {
            warn!("digest carries no new postings, nothing to send");
            return Ok(());
        }

        let subject = digest_subject(digest);
        let html = render_digest(digest)?;
        let email = self.message(&subject, html)?;
        self.transport
            .send(email)
            .await
            .map_err(|e| NotifyError::Smtp(e.to_string()))?;

        info!(
            channel = "email",
            subject = %subject,
            recipients = self.to.len(),
            "digest delivered"
        );
        Ok(())
    }

    async fn probe(&self) -> Result<(), NotifyError> {
        let email = self.message(
            "Jobwatch test notification",
            "<p>The jobwatch mail channel is configured correctly.</p>".to_string(),
        )?;
        self.transport
            .send(email)
            .await
            .map_err(|e| NotifyError::Smtp(e.to_string()))?;
        Ok(())
    }

    fn channel_name(&self) -> &str {
        "email"
    }
}

/// Subject line for a digest: `"<N> new job posting(s) across <labels>"`.
pub fn digest_subject(digest: &Digest) -> String {
    format!(
        "{} new job posting(s) across {}",
        digest.total_new,
        digest.source_labels().join(" & ")
    )
}

const DIGEST_TEMPLATE: &str = r#"<html>
<head>
<style>
  body { font-family: 'Segoe UI', Arial, sans-serif; background-color: #f5f5f5; margin: 0; padding: 20px; }
  .container { max-width: 600px; margin: 0 auto; background-color: #ffffff; border-radius: 8px; overflow: hidden; }
  .header { background: #1a1a2e; color: white; padding: 24px; text-align: center; }
  .header h1 { margin: 0; font-size: 24px; }
  .section-header { padding: 14px 24px 6px 24px; font-size: 13px; font-weight: 600; text-transform: uppercase; }
  .content { padding: 12px 24px 24px 24px; }
  .job-card { border: 1px solid #e1e1e1; border-left: 4px solid #0078d4; padding: 16px; margin-bottom: 16px; border-radius: 8px; background-color: #fafafa; }
  .job-title { font-size: 18px; font-weight: 600; margin: 0 0 8px 0; }
  .job-location { color: #666; font-size: 14px; margin: 4px 0 12px 0; }
  .apply-btn { display: inline-block; color: white !important; background-color: #0078d4; padding: 10px 20px; text-decoration: none; border-radius: 4px; font-size: 14px; }
  .footer { background-color: #f5f5f5; padding: 16px 24px; text-align: center; font-size: 12px; color: #888; }
</style>
</head>
<body>
<div class="container">
  <div class="header">
    <h1>New Job Postings</h1>
    <p>{{ total_new }} new posting{% if total_new != 1 %}s{% endif %} across {{ groups | length }} source{% if groups | length != 1 %}s{% endif %}</p>
  </div>
  <div class="content">
    {% for group in groups %}
    <div class="section-header">{{ group.display_name }} &mdash; {{ group.count }} new</div>
    {% for job in group.jobs %}
    <div class="job-card">
      <h3 class="job-title">{{ job.title }}</h3>
      <p class="job-location">{{ job.location }}</p>
      <a href="{{ job.link }}" class="apply-btn">View Job</a>
    </div>
    {% endfor %}
    {% endfor %}
  </div>
  <div class="footer">
    <p>Sent by jobwatch.</p>
  </div>
</div>
</body>
</html>
"#;

/// Renders the grouped digest to an HTML body. The template is registered
/// under an `.html` name so minijinja escapes interpolated values.
pub fn render_digest(digest: &Digest) -> Result<String, NotifyError> {
    let mut env = Environment::new();
    env.add_template("digest.html", DIGEST_TEMPLATE)
        .map_err(|e| NotifyError::Template(e.to_string()))?;
    let template = env
        .get_template("digest.html")
        .map_err(|e| NotifyError::Template(e.to_string()))?;
    template
        .render(digest)
        .map_err(|e| NotifyError::Template(e.to_string()))
}
