//! Mail transport capability.
//!
//! The send worker only needs "hand this message to the next hop, tell me
//! whether it took it". Each worker slot opens its own transport, so a stalled
//! delivery only blocks that slot.

pub mod sendmail;

use async_trait::async_trait;

pub use sendmail::Sendmail;

/// One message ready for delivery.
#[derive(Debug, Clone, Copy)]
pub struct OutgoingMail<'a> {
    /// `Name <local@domain>` form, used as the envelope sender.
    pub envelope_sender: &'a str,
    /// `Name <address>` or a bare address.
    pub recipient: &'a str,
    pub header: &'a str,
    pub body: &'a str,
}

/// Delivery attempt rejected. Carries whatever the next hop said.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("delivery failed: {diagnostic}")]
pub struct TransportError {
    pub diagnostic: String,
}

impl TransportError {
    pub fn new(diagnostic: impl Into<String>) -> Self {
        Self {
            diagnostic: diagnostic.into(),
        }
    }
}

#[async_trait]
pub trait MailTransport: Send {
    async fn send(&mut self, mail: &OutgoingMail<'_>) -> Result<(), TransportError>;

    /// Drop any session state so the next attempt starts fresh.
    async fn reset(&mut self) {}
}

/// Opens one transport per worker slot.
pub trait TransportFactory: Send + Sync {
    fn open(&self) -> Box<dyn MailTransport>;
}

/// Accepts everything without any I/O. Used in development mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct Noop;

#[async_trait]
impl MailTransport for Noop {
    async fn send(&mut self, mail: &OutgoingMail<'_>) -> Result<(), TransportError> {
        tracing::debug!(recipient = mail.recipient, "noop delivery");
        Ok(())
    }
}

/// Transport selected from configuration.
#[derive(Debug, Clone)]
pub enum TransportKind {
    Noop,
    Sendmail { program: String },
}

impl TransportFactory for TransportKind {
    fn open(&self) -> Box<dyn MailTransport> {
        match self {
            TransportKind::Noop => Box::new(Noop),
            TransportKind::Sendmail { program } => Box::new(Sendmail::new(program.clone())),
        }
    }
}

/// Bare address out of `Name <address>`.
pub fn address_of(mailbox: &str) -> &str {
    match (mailbox.rfind('<'), mailbox.rfind('>')) {
        (Some(start), Some(end)) if start < end => mailbox[start + 1..end].trim(),
        _ => mailbox.trim(),
    }
}
