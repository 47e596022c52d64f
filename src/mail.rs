//! Mail Transport: the sweeper's view of "send this notification", kept
//! behind a trait so SMTP and an in-memory recorder are interchangeable.

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::MailError;

/// A single gzip-compressed attachment.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub gzip_bytes: Vec<u8>,
}

/// A notification e-mail, fully assembled by the [`crate::notifier`].
#[derive(Debug, Clone)]
pub struct Envelope {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<Attachment>,
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, envelope: Envelope) -> Result<(), MailError>;
}

/// Production transport: SMTP via `lettre`.
pub struct SmtpMailTransport {
    transport: lettre::AsyncSmtpTransport<lettre::Tokio1Executor>,
    sender: String,
}

impl SmtpMailTransport {
    pub fn new(config: &crate::config::SmtpConfig, sender: String) -> Result<Self, MailError> {
        let builder = if config.tls {
            lettre::AsyncSmtpTransport::<lettre::Tokio1Executor>::relay(&config.host)
                .map_err(|e| MailError::Transport(e.to_string()))?
        } else {
            lettre::AsyncSmtpTransport::<lettre::Tokio1Executor>::builder_dangerous(&config.host)
        };
        let transport = builder.port(config.port).build();
        Ok(Self { transport, sender })
    }
}

#[async_trait]
impl MailTransport for SmtpMailTransport {
    async fn send(&self, envelope: Envelope) -> Result<(), MailError> {
        use lettre::AsyncTransport;
        use lettre::message::{Attachment as LettreAttachment, MultiPart, SinglePart, header::ContentType};

        let mut multipart = MultiPart::mixed().singlepart(SinglePart::plain(envelope.body.clone()));
        for attachment in &envelope.attachments {
            multipart = multipart.singlepart(
                LettreAttachment::new(attachment.filename.clone())
                    .body(attachment.gzip_bytes.clone(), ContentType::parse("application/gzip").unwrap()),
            );
        }

        let message = lettre::Message::builder()
            .from(self.sender.parse().map_err(|e: lettre::address::AddressError| MailError::Transport(e.to_string()))?)
            .to(envelope.to.parse().map_err(|e: lettre::address::AddressError| MailError::Transport(e.to_string()))?)
            .subject(envelope.subject.clone())
            .multipart(multipart)
            .map_err(|e| MailError::Transport(e.to_string()))?;

        self.transport.send(message).await.map_err(|e| MailError::Transport(e.to_string()))?;
        Ok(())
    }
}

/// Test/dry-run transport: records every envelope instead of sending it.
#[derive(Default)]
pub struct RecordingMailTransport {
    sent: Mutex<Vec<Envelope>>,
}

impl RecordingMailTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl MailTransport for RecordingMailTransport {
    async fn send(&self, envelope: Envelope) -> Result<(), MailError> {
        self.sent.lock().push(envelope);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_transport_captures_envelopes() {
        let transport = RecordingMailTransport::new();
        transport
            .send(Envelope {
                to: "alice@example.com".to_string(),
                subject: "subj".to_string(),
                body: "body".to_string(),
                attachments: vec![],
            })
            .await
            .unwrap();
        assert_eq!(transport.sent().len(), 1);
        assert_eq!(transport.sent()[0].to, "alice@example.com");
    }
}
