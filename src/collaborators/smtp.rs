//! SMTP mail sender via lettre.
//!
//! All mail goes through one relay. The `From` mailbox is picked per sender id
//! from `SMTP_SENDER_ADDRESSES`, falling back to `SMTP_FROM_ADDRESS`; the relay
//! account must be allowed to send as each configured address.
//!
//! lettre's `SmtpTransport` is blocking, so each send runs on the blocking pool.

use std::collections::HashMap;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;

use crate::collaborators::{MailSender, OutboundEmail};
use crate::config::SmtpConfig;
use crate::error::{ConfigError, DispatchError};

/// Sends sequence emails through one SMTP relay.
pub struct SmtpMailSender {
    transport: SmtpTransport,
    from: Mailbox,
    senders: HashMap<String, Mailbox>,
}

impl SmtpMailSender {
    pub fn new(config: &SmtpConfig) -> Result<Self, ConfigError> {
        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );

        let transport = SmtpTransport::relay(&config.host)
            .map_err(|e| ConfigError::InvalidValue {
                key: "SMTP_HOST".into(),
                message: format!("SMTP relay error: {e}"),
            })?
            .port(config.port)
            .credentials(creds)
            .build();

        let from = config
            .from_address
            .parse()
            .map_err(|e| ConfigError::InvalidValue {
                key: "SMTP_FROM_ADDRESS".into(),
                message: format!("Invalid from address: {e}"),
            })?;

        let senders = config
            .sender_addresses
            .iter()
            .map(|(sender, address)| {
                let mailbox = address.parse().map_err(|e| ConfigError::InvalidValue {
                    key: "SMTP_SENDER_ADDRESSES".into(),
                    message: format!("Invalid address for sender {sender}: {e}"),
                })?;
                Ok((sender.clone(), mailbox))
            })
            .collect::<Result<HashMap<_, _>, ConfigError>>()?;

        Ok(Self {
            transport,
            from,
            senders,
        })
    }

    fn from_for(&self, sender_id: &str) -> &Mailbox {
        self.senders.get(sender_id).unwrap_or(&self.from)
    }

    fn build(&self, email: &OutboundEmail) -> Result<Message, DispatchError> {
        let failed = |reason: String| DispatchError::Failed {
            contact_id: email.contact_id.clone(),
            reason,
        };

        let to: Mailbox = email
            .to
            .parse()
            .map_err(|e| failed(format!("Invalid to address: {e}")))?;

        Message::builder()
            .from(self.from_for(&email.sender_id).clone())
            .to(to)
            .subject(email.subject.as_str())
            .body(email.body.clone())
            .map_err(|e| failed(format!("Failed to build email: {e}")))
    }
}

#[async_trait]
impl MailSender for SmtpMailSender {
    async fn send(&self, email: &OutboundEmail) -> Result<(), DispatchError> {
        let message = self.build(email)?;
        let transport = self.transport.clone();
        let contact_id = email.contact_id.clone();

        tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|e| DispatchError::Failed {
                contact_id: contact_id.clone(),
                reason: format!("SMTP worker panicked: {e}"),
            })?
            .map_err(|e| DispatchError::Failed {
                contact_id: contact_id.clone(),
                reason: format!("SMTP send failed: {e}"),
            })?;

        tracing::info!(
            enrollment_id = %email.enrollment_id,
            contact_id = %email.contact_id,
            "Email sent"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;
    use uuid::Uuid;

    use super::*;

    fn config(from: &str) -> SmtpConfig {
        SmtpConfig {
            host: "smtp.example.com".into(),
            port: 587,
            username: "outreach@example.com".into(),
            password: SecretString::from("hunter2"),
            from_address: from.into(),
            sender_addresses: HashMap::from([("s-ada".to_string(), "ada@engine.io".to_string())]),
        }
    }

    fn outbound(to: &str) -> OutboundEmail {
        OutboundEmail {
            enrollment_id: Uuid::new_v4(),
            sequence_id: Uuid::new_v4(),
            sender_id: "s".into(),
            contact_id: "c1".into(),
            to: to.into(),
            subject: "Hi Ada".into(),
            body: "Hello".into(),
        }
    }

    #[test]
    fn rejects_bad_from_address() {
        let err = SmtpMailSender::new(&config("not an address")).err().unwrap();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "SMTP_FROM_ADDRESS"));
    }

    #[test]
    fn builds_message_for_valid_recipient() {
        let sender = SmtpMailSender::new(&config("outreach@example.com")).unwrap();
        let message = sender.build(&outbound("ada@engine.io")).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("To: ada@engine.io"));
        assert!(raw.contains("Subject: Hi Ada"));
    }

    #[test]
    fn from_address_follows_the_sender() {
        let sender = SmtpMailSender::new(&config("outreach@example.com")).unwrap();

        let mut email = outbound("grace@navy.mil");
        email.sender_id = "s-ada".into();
        let raw = String::from_utf8(sender.build(&email).unwrap().formatted()).unwrap();
        assert!(raw.contains("From: ada@engine.io"));

        let raw = String::from_utf8(sender.build(&outbound("grace@navy.mil")).unwrap().formatted())
            .unwrap();
        assert!(raw.contains("From: outreach@example.com"));
    }

    #[test]
    fn bad_sender_address_is_rejected() {
        let mut cfg = config("outreach@example.com");
        cfg.sender_addresses.insert("s-bad".into(), "not an address".into());
        let err = SmtpMailSender::new(&cfg).err().unwrap();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "SMTP_SENDER_ADDRESSES"));
    }

    #[test]
    fn bad_recipient_is_a_dispatch_error() {
        let sender = SmtpMailSender::new(&config("outreach@example.com")).unwrap();
        let err = sender.build(&outbound("nope")).unwrap_err();
        assert!(matches!(err, DispatchError::Failed { ref contact_id, .. } if contact_id == "c1"));
    }
}
