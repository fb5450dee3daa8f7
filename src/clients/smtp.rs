use anyhow::{Error, Result};
use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, header::ContentType},
    transport::smtp::{authentication::Credentials, response::Response},
};
use thiserror::Error as ThisError;
use tracing::{debug, info};

use crate::{
    clients::circuit_breaker::CircuitBreaker, config::Config, models::message::FormattedEmail,
};

#[derive(Debug, ThisError)]
pub enum MailError {
    #[error("SMTP transport error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),

    #[error("email address parse error: {0}")]
    Address(#[from] lettre::address::AddressError),

    #[error("email build error: {0}")]
    Build(#[from] lettre::error::Error),
}

/// Outbound transport for formatted emails.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Sends the email and returns the server's response text.
    async fn send(&self, email: &FormattedEmail) -> Result<String, Error>;
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    circuit_breaker: Option<CircuitBreaker>,
}

impl SmtpMailer {
    /// Implicit TLS relay authenticated with the configured login.
    pub fn new(config: &Config, circuit_breaker: Option<CircuitBreaker>) -> Result<Self, Error> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
            .map_err(MailError::from)?
            .port(config.smtp_port)
            .credentials(Credentials::new(
                config.smtp_login.clone(),
                config.smtp_password.clone(),
            ))
            .timeout(Some(config.http_timeout()))
            .build();

        let from: Mailbox = config.smtp_from_address.parse().map_err(MailError::from)?;

        info!(
            host = %config.smtp_host,
            port = config.smtp_port,
            "SMTP transport initialized"
        );

        Ok(Self {
            transport,
            from,
            circuit_breaker,
        })
    }

    async fn deliver(&self, message: Message) -> Result<String, Error> {
        let response = self
            .transport
            .send(message)
            .await
            .map_err(MailError::from)?;

        Ok(describe_response(&response))
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send(&self, email: &FormattedEmail) -> Result<String, Error> {
        let message = build_message(&self.from, email)?;

        let result = match &self.circuit_breaker {
            Some(breaker) => breaker.call(|| self.deliver(message)).await?,
            None => self.deliver(message).await?,
        };

        debug!(
            notification_id = %email.notification_id,
            response = %result,
            "SMTP server accepted message"
        );

        Ok(result)
    }
}

pub fn build_message(from: &Mailbox, email: &FormattedEmail) -> Result<Message, MailError> {
    let message = Message::builder()
        .from(from.clone())
        .to(email.to.parse()?)
        .reply_to(email.reply_to.parse()?)
        .subject(email.subject.as_str())
        .header(ContentType::TEXT_HTML)
        .body(email.html.clone())?;

    Ok(message)
}

/// Response code followed by the server's message lines, e.g. `250 2.0.0 OK queued`.
fn describe_response(response: &Response) -> String {
    let lines: Vec<&str> = response.message().collect();
    format!("{} {}", response.code(), lines.join(" "))
}
