use async_trait::async_trait;
use lettre::address::AddressError;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::SmtpConfig;

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("invalid mail address `{address}`")]
    Address {
        address: String,
        #[source]
        source: AddressError,
    },
    #[error("building alert mail")]
    Message(#[from] lettre::error::Error),
    #[error("smtp delivery failed")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

/// Delivers a deal digest or failure report. Failures are returned, never swallowed.
#[async_trait]
pub trait AlertDispatcher: Send + Sync {
    fn name(&self) -> &'static str;

    async fn dispatch(&self, subject: &str, body: &[u8]) -> Result<(), AlertError>;
}

pub struct SmtpDispatcher {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
}

fn parse_mailbox(address: &str) -> Result<Mailbox, AlertError> {
    address.parse().map_err(|source| AlertError::Address {
        address: address.to_string(),
        source,
    })
}

impl SmtpDispatcher {
    /// STARTTLS relay authenticated with the configured account, which is also the sender.
    pub fn new(config: &SmtpConfig) -> Result<Self, AlertError> {
        let sender = if config.username.is_empty() {
            &config.recipient
        } else {
            &config.username
        };
        let from = parse_mailbox(sender)?;
        let to = parse_mailbox(&config.recipient)?;
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.server)?
            .port(config.port)
            .credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ))
            .build();

        Ok(Self { transport, from, to })
    }
}

#[async_trait]
impl AlertDispatcher for SmtpDispatcher {
    fn name(&self) -> &'static str {
        "smtp"
    }

    async fn dispatch(&self, subject: &str, body: &[u8]) -> Result<(), AlertError> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_vec())?;
        self.transport.send(message).await?;
        info!(to = %self.to, "alert mail sent: {subject}");
        Ok(())
    }
}

/// Writes alerts to the log; used when no mail server is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDispatcher;

#[async_trait]
impl AlertDispatcher for LogDispatcher {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn dispatch(&self, subject: &str, body: &[u8]) -> Result<(), AlertError> {
        info!("{subject}\n{}", String::from_utf8_lossy(body));
        Ok(())
    }
}

pub fn dispatcher_for(smtp: Option<&SmtpConfig>) -> Result<Box<dyn AlertDispatcher>, AlertError> {
    match smtp {
        Some(config) => Ok(Box::new(SmtpDispatcher::new(config)?)),
        None => {
            warn!("SMTP_SERVER not set; alerts are written to the log only");
            Ok(Box::new(LogDispatcher))
        }
    }
}

/// Subject and body reporting a failed run, with the captured log appended when present.
pub fn failure_alert(err: &anyhow::Error, log: Option<&[u8]>) -> (String, Vec<u8>) {
    let subject = format!("💥 fundgrube run failed: {err}");
    let mut body = format!("{err:?}\n").into_bytes();
    if let Some(log) = log {
        body.extend_from_slice(b"\n--- log ---\n");
        body.extend_from_slice(log);
    }
    (subject, body)
}
