use super::{DeliveryError, Notifier};
use crate::config::NotifySettings;
use lettre::message::header::ContentType;
use lettre::message::{Mailbox, MessageBuilder};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SendmailTransport, SmtpTransport, Transport};
use tracing::{debug, warn};

const DEFAULT_SMTP_PORT: u16 = 587;

fn parse_mailbox(address: &str) -> Result<Mailbox, DeliveryError> {
    address.trim().parse().map_err(|source| DeliveryError::Address {
        address: address.trim().to_string(),
        source,
    })
}

/// Parses a comma-separated recipient list.
fn parse_recipients(list: &str) -> Result<Vec<Mailbox>, DeliveryError> {
    let recipients = list
        .split(',')
        .filter(|a| !a.trim().is_empty())
        .map(parse_mailbox)
        .collect::<Result<Vec<_>, _>>()?;
    if recipients.is_empty() {
        return Err(DeliveryError::NoRecipients);
    }
    Ok(recipients)
}

fn build_message(
    from: &Mailbox,
    to: &[Mailbox],
    subject: &str,
    body: &str,
) -> Result<Message, DeliveryError> {
    let builder: MessageBuilder = to
        .iter()
        .cloned()
        .fold(Message::builder().from(from.clone()), MessageBuilder::to);
    Ok(builder
        .subject(subject)
        .header(ContentType::TEXT_PLAIN)
        .body(body.to_string())?)
}

/// STARTTLS SMTP relay with login credentials. An optional SMS gateway
/// address receives a copy of every alert.
pub struct SmtpNotifier {
    transport: SmtpTransport,
    from: Mailbox,
    to: Vec<Mailbox>,
    sms: Option<Mailbox>,
}

impl SmtpNotifier {
    pub fn new(settings: &NotifySettings, from: &str) -> Result<Self, DeliveryError> {
        let mut builder = SmtpTransport::starttls_relay(&settings.smtp_server)?
            .port(settings.smtp_port.unwrap_or(DEFAULT_SMTP_PORT));
        if !settings.smtp_account.is_empty() {
            builder = builder.credentials(Credentials::new(
                settings.smtp_account.clone(),
                settings.smtp_password.clone(),
            ));
        }
        Ok(Self {
            transport: builder.build(),
            from: parse_mailbox(from)?,
            to: parse_recipients(&settings.to)?,
            sms: settings
                .sms
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .map(parse_mailbox)
                .transpose()?,
        })
    }
}

impl Notifier for SmtpNotifier {
    fn deliver(&mut self, subject: &str, body: &str) -> Result<(), DeliveryError> {
        let message = build_message(&self.from, &self.to, subject, body)?;
        self.transport.send(&message)?;
        debug!(recipients = self.to.len(), "alert mail sent");

        if let Some(sms) = &self.sms {
            let text = body.lines().next().unwrap_or_default();
            let message = build_message(&self.from, std::slice::from_ref(sms), subject, text)?;
            // the mail already went out; an SMS failure is not fatal
            if let Err(e) = self.transport.send(&message) {
                warn!(error = %e, "SMS copy of alert not sent");
            }
        }
        Ok(())
    }
}

/// Local MTA through a sendmail-compatible binary (`sendmail`, `ssmtp`).
pub struct SendmailNotifier {
    transport: SendmailTransport,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl SendmailNotifier {
    pub fn new(settings: &NotifySettings, from: &str) -> Result<Self, DeliveryError> {
        let transport = match settings.sendmail_command.as_deref() {
            Some(command) if !command.trim().is_empty() => {
                SendmailTransport::new_with_command(command.trim())
            }
            _ => SendmailTransport::new(),
        };
        Ok(Self {
            transport,
            from: parse_mailbox(from)?,
            to: parse_recipients(&settings.to)?,
        })
    }
}

impl Notifier for SendmailNotifier {
    fn deliver(&mut self, subject: &str, body: &str) -> Result<(), DeliveryError> {
        let message = build_message(&self.from, &self.to, subject, body)?;
        self.transport.send(&message)?;
        debug!(recipients = self.to.len(), "alert mail handed to sendmail");
        Ok(())
    }
}
