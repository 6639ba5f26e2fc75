//! Alert delivery.
//!
//! The monitor hands a subject and a newline-joined body to a [`Notifier`].
//! With `emailalerts` off the body only goes to the log.

mod mail;

pub use mail::{SendmailNotifier, SmtpNotifier};

use crate::config::{Config, MailMethod};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("invalid address {address:?}: {source}")]
    Address {
        address: String,
        #[source]
        source: lettre::address::AddressError,
    },
    #[error("no recipients configured")]
    NoRecipients,
    #[error("cannot build message: {0}")]
    Build(#[from] lettre::error::Error),
    #[error("SMTP delivery failed: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("sendmail delivery failed: {0}")]
    Sendmail(#[from] lettre::transport::sendmail::Error),
}

pub trait Notifier: Send {
    fn deliver(&mut self, subject: &str, body: &str) -> Result<(), DeliveryError>;
}

/// Writes alerts to the log instead of sending them.
#[derive(Debug, Default)]
pub struct LogOnlyNotifier;

impl Notifier for LogOnlyNotifier {
    fn deliver(&mut self, subject: &str, body: &str) -> Result<(), DeliveryError> {
        info!(subject, lines = body.lines().count(), "email alerts off, not sending:\n{body}");
        Ok(())
    }
}

/// Builds the notifier for the configured delivery method.
pub fn from_config(config: &Config) -> Result<Box<dyn Notifier>, DeliveryError> {
    let notify = &config.notify;
    if !notify.emailalerts {
        return Ok(Box::new(LogOnlyNotifier));
    }
    let from = notify
        .from
        .clone()
        .unwrap_or_else(|| default_sender(&config.database.user, &config.database.host));
    match notify.method {
        Some(MailMethod::Smtp) => Ok(Box::new(SmtpNotifier::new(notify, &from)?)),
        Some(MailMethod::Sendmail) | None => Ok(Box::new(SendmailNotifier::new(notify, &from)?)),
    }
}

fn default_sender(user: &str, host: &str) -> String {
    let host = if host.contains('.') { host } else { "localhost.localdomain" };
    format!("PostgreSQL Administrator <{user}@{host}>")
}
