//! Outbound collaborators: the mail sender and the external contact store.
//!
//! The engine only talks to the outside world through these two traits. The
//! bundled adapters are [`SmtpMailSender`] and [`HttpContactStore`];
//! [`memory`] holds in-process versions for embedding and tests.

pub mod http;
pub mod memory;
pub mod smtp;

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::contact::{ContactSnapshot, OutreachStatus};
use crate::error::{ContactStoreError, DispatchError};

pub use http::HttpContactStore;
pub use memory::{ContactWrite, MemoryContactStore, RecordingMailSender};
pub use smtp::SmtpMailSender;

/// A fully rendered email ready to hand to the mail sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundEmail {
    pub enrollment_id: Uuid,
    pub sequence_id: Uuid,
    /// Mailbox owner the email is sent as.
    pub sender_id: String,
    pub contact_id: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Delivers one email. Implementations must not retry internally; the
/// scheduler owns retries and backoff.
#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> Result<(), DispatchError>;
}

/// Read and write access to contact records owned by the lead store.
///
/// Writes are non-destructive: `add_to_list` never removes other lists and
/// `add_tags` is a set union.
#[async_trait]
pub trait ContactStore: Send + Sync {
    async fn get_snapshot(&self, contact_id: &str) -> Result<ContactSnapshot, ContactStoreError>;

    async fn set_outreach_status(
        &self,
        contact_id: &str,
        status: OutreachStatus,
    ) -> Result<(), ContactStoreError>;

    async fn add_to_list(&self, contact_id: &str, list: &str) -> Result<(), ContactStoreError>;

    async fn add_tags(
        &self,
        contact_id: &str,
        tags: &BTreeSet<String>,
    ) -> Result<(), ContactStoreError>;
}
