//! In-process collaborators.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::collaborators::{ContactStore, MailSender, OutboundEmail};
use crate::contact::{ContactSnapshot, OutreachStatus};
use crate::error::{ContactStoreError, DispatchError};

/// One write made through [`MemoryContactStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContactWrite {
    Status(String, OutreachStatus),
    List(String, String),
    Tags(String, BTreeSet<String>),
}

/// Contact store held in a map; records every write it receives.
///
/// Writes can be made to fail on demand to exercise automation retries.
#[derive(Default)]
pub struct MemoryContactStore {
    contacts: RwLock<HashMap<String, ContactSnapshot>>,
    writes: RwLock<Vec<ContactWrite>>,
    failing_writes: AtomicU32,
}

impl MemoryContactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, contact: ContactSnapshot) {
        self.contacts
            .write()
            .await
            .insert(contact.id.clone(), contact);
    }

    pub async fn remove(&self, contact_id: &str) -> Option<ContactSnapshot> {
        self.contacts.write().await.remove(contact_id)
    }

    pub async fn get(&self, contact_id: &str) -> Option<ContactSnapshot> {
        self.contacts.read().await.get(contact_id).cloned()
    }

    /// Fail the next `n` writes as if the store were unreachable.
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Every write so far, in order.
    pub async fn writes(&self) -> Vec<ContactWrite> {
        self.writes.read().await.clone()
    }

    async fn update<F>(&self, contact_id: &str, write: ContactWrite, f: F) -> Result<(), ContactStoreError>
    where
        F: FnOnce(&mut ContactSnapshot),
    {
        let failing = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ContactStoreError::Request(
                "503 Service Unavailable".to_string(),
            ));
        }
        let mut contacts = self.contacts.write().await;
        let contact = contacts
            .get_mut(contact_id)
            .ok_or_else(|| ContactStoreError::NotFound {
                contact_id: contact_id.to_string(),
            })?;
        f(contact);
        self.writes.write().await.push(write);
        Ok(())
    }
}

#[async_trait]
impl ContactStore for MemoryContactStore {
    async fn get_snapshot(&self, contact_id: &str) -> Result<ContactSnapshot, ContactStoreError> {
        self.get(contact_id)
            .await
            .ok_or_else(|| ContactStoreError::NotFound {
                contact_id: contact_id.to_string(),
            })
    }

    async fn set_outreach_status(
        &self,
        contact_id: &str,
        status: OutreachStatus,
    ) -> Result<(), ContactStoreError> {
        self.update(
            contact_id,
            ContactWrite::Status(contact_id.to_string(), status),
            |c| c.outreach_status = Some(status),
        )
        .await
    }

    async fn add_to_list(&self, contact_id: &str, list: &str) -> Result<(), ContactStoreError> {
        self.update(
            contact_id,
            ContactWrite::List(contact_id.to_string(), list.to_string()),
            |c| {
                c.lists.insert(list.to_string());
            },
        )
        .await
    }

    async fn add_tags(
        &self,
        contact_id: &str,
        tags: &BTreeSet<String>,
    ) -> Result<(), ContactStoreError> {
        self.update(
            contact_id,
            ContactWrite::Tags(contact_id.to_string(), tags.clone()),
            |c| c.tags.extend(tags.iter().cloned()),
        )
        .await
    }
}

/// Mail sender that keeps what it was asked to send.
///
/// It can be told to fail a number of upcoming sends or to stall, which is
/// how retry, bounce and timeout paths are exercised.
#[derive(Default)]
pub struct RecordingMailSender {
    sent: RwLock<Vec<OutboundEmail>>,
    failures_left: AtomicU32,
    stall: RwLock<Option<Duration>>,
}

impl RecordingMailSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` sends.
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Sleep this long before every send.
    pub async fn stall_for(&self, delay: Duration) {
        *self.stall.write().await = Some(delay);
    }

    pub async fn sent(&self) -> Vec<OutboundEmail> {
        self.sent.read().await.clone()
    }
}

#[async_trait]
impl MailSender for RecordingMailSender {
    async fn send(&self, email: &OutboundEmail) -> Result<(), DispatchError> {
        let stall = *self.stall.read().await;
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DispatchError::Failed {
                contact_id: email.contact_id.clone(),
                reason: "mailbox unavailable".into(),
            });
        }

        self.sent.write().await.push(email.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn email() -> OutboundEmail {
        OutboundEmail {
            enrollment_id: Uuid::new_v4(),
            sequence_id: Uuid::new_v4(),
            sender_id: "s".into(),
            contact_id: "c1".into(),
            to: "c1@example.com".into(),
            subject: "Hi".into(),
            body: "Body".into(),
        }
    }

    #[tokio::test]
    async fn writes_are_set_unions() {
        let store = MemoryContactStore::new();
        store.insert(ContactSnapshot::new("c1").with_tag("a")).await;

        store.add_tags("c1", &BTreeSet::from(["a".into(), "b".into()])).await.unwrap();
        store.add_to_list("c1", "Bounced").await.unwrap();
        store.add_to_list("c1", "Bounced").await.unwrap();

        let contact = store.get("c1").await.unwrap();
        assert_eq!(contact.tags, BTreeSet::from(["a".into(), "b".into()]));
        assert_eq!(contact.lists, BTreeSet::from(["Bounced".into()]));
        assert_eq!(store.writes().await.len(), 3);
    }

    #[tokio::test]
    async fn unknown_contact_is_not_found() {
        let store = MemoryContactStore::new();
        let err = store.get_snapshot("ghost").await.unwrap_err();
        assert!(matches!(err, ContactStoreError::NotFound { .. }));
        assert!(store.add_to_list("ghost", "x").await.is_err());
        assert!(store.writes().await.is_empty());
    }

    #[tokio::test]
    async fn sender_fails_then_recovers() {
        let sender = RecordingMailSender::new();
        sender.fail_next(2);
        assert!(sender.send(&email()).await.is_err());
        assert!(sender.send(&email()).await.is_err());
        assert!(sender.send(&email()).await.is_ok());
        assert_eq!(sender.sent().await.len(), 1);
    }
}
