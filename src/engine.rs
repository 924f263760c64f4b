//! The operations the platform calls.
//!
//! `Engine` owns the store, the rate limiter and the scheduler and exposes
//! sequence management, enrollment, event ingestion and sender limits. Every
//! time-dependent operation takes `now` so callers (and tests) control the clock.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::automation::TriggerOutcome;
use crate::collaborators::{ContactStore, MailSender};
use crate::config::EngineConfig;
use crate::criteria;
use crate::enrollment::{Enrollment, EnrollmentStatus, EventKind};
use crate::error::{ContactStoreError, DatabaseError, EnrollmentError, Result};
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::scheduler::{EngineNotice, Scheduler, TickReport};
use crate::sequence::{Sequence, SequenceSpec, SequenceStatus};
use crate::store::Database;

/// Compare-and-set retries before a concurrent writer is reported as an error.
const MAX_CAS_ATTEMPTS: usize = 5;

/// A contact that was not enrolled, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedContact {
    pub contact_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollOutcome {
    pub admitted: Vec<Enrollment>,
    pub skipped: Vec<SkippedContact>,
}

/// An engagement event from the reply/bounce detection feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngagementEvent {
    pub enrollment_id: Uuid,
    pub event_kind: EventKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventOutcome {
    pub enrollment: Enrollment,
    pub trigger: TriggerOutcome,
}

pub struct Engine {
    store: Arc<dyn Database>,
    contacts: Arc<dyn ContactStore>,
    limiter: Arc<RateLimiter>,
    scheduler: Arc<Scheduler>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Database>,
        contacts: Arc<dyn ContactStore>,
        mailer: Arc<dyn MailSender>,
        config: EngineConfig,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(Arc::clone(&store)));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&contacts),
            mailer,
            Arc::clone(&limiter),
            config,
        ));
        Self {
            store,
            contacts,
            limiter,
            scheduler,
        }
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        Arc::clone(&self.scheduler)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineNotice> {
        self.scheduler.subscribe()
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        self.scheduler.tick(now).await
    }

    // ── Sequences ──────────────────────────────────────────────────

    /// Validate and store a new sequence. It starts as a draft.
    pub async fn create_sequence(&self, spec: SequenceSpec, now: DateTime<Utc>) -> Result<Sequence> {
        let sequence = Sequence::create(spec, now)?;
        self.store.insert_sequence(&sequence).await?;
        info!(sequence_id = %sequence.id, name = %sequence.spec.name, "Sequence created");
        Ok(sequence)
    }

    /// Replace a sequence's definition. Status and identity are kept.
    ///
    /// Enrollments already past the new last step complete on their next pass.
    pub async fn update_sequence(
        &self,
        id: Uuid,
        spec: SequenceSpec,
        now: DateTime<Utc>,
    ) -> Result<Sequence> {
        spec.validate()?;
        let mut sequence = self.get_sequence(id).await?;
        sequence.spec = spec;
        sequence.updated_at = now;
        if !self.store.update_sequence(&sequence).await? {
            return Err(EnrollmentError::SequenceNotFound { id }.into());
        }
        info!(sequence_id = %id, "Sequence updated");
        Ok(sequence)
    }

    pub async fn get_sequence(&self, id: Uuid) -> Result<Sequence> {
        self.store
            .get_sequence(id)
            .await?
            .ok_or_else(|| EnrollmentError::SequenceNotFound { id }.into())
    }

    pub async fn pause(&self, id: Uuid, now: DateTime<Utc>) -> Result<Sequence> {
        self.set_status(id, &[SequenceStatus::Active], SequenceStatus::Paused, now)
            .await
    }

    /// Resume a paused sequence or activate a draft.
    pub async fn resume(&self, id: Uuid, now: DateTime<Utc>) -> Result<Sequence> {
        self.set_status(
            id,
            &[SequenceStatus::Draft, SequenceStatus::Paused],
            SequenceStatus::Active,
            now,
        )
        .await
    }

    async fn set_status(
        &self,
        id: Uuid,
        from: &[SequenceStatus],
        to: SequenceStatus,
        now: DateTime<Utc>,
    ) -> Result<Sequence> {
        let mut sequence = self.get_sequence(id).await?;
        if !from.contains(&sequence.status) {
            let expected = from
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(" or ");
            return Err(EnrollmentError::InvalidSequenceStatus {
                id,
                status: sequence.status.to_string(),
                expected,
            }
            .into());
        }
        sequence.status = to;
        sequence.updated_at = now;
        self.store.update_sequence(&sequence).await?;
        info!(sequence_id = %id, status = %to, "Sequence status changed");
        Ok(sequence)
    }

    // ── Enrollment ─────────────────────────────────────────────────

    /// Enroll contacts. Entering criteria are checked now and again when the
    /// scheduler admits the enrollment.
    pub async fn enroll(
        &self,
        sequence_id: Uuid,
        contact_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<EnrollOutcome> {
        let sequence = self.get_sequence(sequence_id).await?;
        let mut outcome = EnrollOutcome::default();
        let mut seen = BTreeSet::new();

        for contact_id in contact_ids {
            if !seen.insert(contact_id.as_str()) {
                continue;
            }
            match self.enroll_one(&sequence, contact_id, now).await? {
                Ok(enrollment) => outcome.admitted.push(enrollment),
                Err(reason) => {
                    self.scheduler.notify(EngineNotice::Skipped {
                        sequence_id,
                        contact_id: contact_id.clone(),
                        reason: reason.clone(),
                    });
                    outcome.skipped.push(SkippedContact {
                        contact_id: contact_id.clone(),
                        reason,
                    });
                }
            }
        }

        info!(
            sequence_id = %sequence_id,
            admitted = outcome.admitted.len(),
            skipped = outcome.skipped.len(),
            "Enrollment request processed"
        );
        Ok(outcome)
    }

    /// Inner result is the new enrollment or the skip reason.
    async fn enroll_one(
        &self,
        sequence: &Sequence,
        contact_id: &str,
        now: DateTime<Utc>,
    ) -> Result<std::result::Result<Enrollment, String>> {
        let contact = match self.contacts.get_snapshot(contact_id).await {
            Ok(contact) => contact,
            Err(ContactStoreError::NotFound { .. }) => {
                return Ok(Err("contact not found".to_string()));
            }
            Err(e) => {
                warn!(contact_id = %contact_id, error = %e, "Contact lookup failed during enroll");
                return Ok(Err(format!("contact lookup failed: {e}")));
            }
        };

        let admission = criteria::admit(&contact, &sequence.spec.entering_criteria);
        if !admission.admitted {
            return Ok(Err(admission.reason.unwrap_or_default()));
        }

        let enrollment = Enrollment::new(sequence, contact_id, now);
        if !self.store.insert_enrollment(&enrollment).await? {
            return Ok(Err("already enrolled".to_string()));
        }
        Ok(Ok(enrollment))
    }

    pub async fn get_enrollment_status(&self, id: Uuid) -> Result<EnrollmentStatus> {
        let enrollment = self.get_enrollment(id).await?;
        let total_steps = self
            .store
            .get_sequence(enrollment.sequence_id)
            .await?
            .map(|s| s.step_count())
            .unwrap_or(0);
        Ok(EnrollmentStatus {
            terminal: enrollment.state.is_terminal(),
            total_steps,
            enrollment,
        })
    }

    async fn get_enrollment(&self, id: Uuid) -> Result<Enrollment> {
        self.store
            .get_enrollment(id)
            .await?
            .ok_or_else(|| EnrollmentError::NotFound { id }.into())
    }

    /// Load, change and conditionally save an enrollment, retrying when the
    /// stored state moved underneath.
    async fn update_enrollment<F>(&self, id: Uuid, mut change: F) -> Result<Enrollment>
    where
        F: FnMut(&mut Enrollment) -> std::result::Result<(), EnrollmentError>,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut enrollment = self.get_enrollment(id).await?;
            let expected = enrollment.state;
            change(&mut enrollment)?;
            if self.store.save_if_state(&enrollment, expected).await? {
                return Ok(enrollment);
            }
        }
        Err(DatabaseError::Constraint(format!(
            "enrollment {id} kept changing; gave up after {MAX_CAS_ATTEMPTS} attempts"
        ))
        .into())
    }

    pub async fn unenroll(&self, id: Uuid, now: DateTime<Utc>) -> Result<Enrollment> {
        let enrollment = self
            .update_enrollment(id, |e| e.remove("unenrolled", now))
            .await?;
        info!(enrollment_id = %id, "Enrollment removed");
        Ok(enrollment)
    }

    /// Remove every live enrollment of a deleted contact. Returns how many.
    pub async fn remove_contact(&self, contact_id: &str, now: DateTime<Utc>) -> Result<usize> {
        let live = self.store.list_live_for_contact(contact_id).await?;
        let mut removed = 0;
        for enrollment in live {
            match self
                .update_enrollment(enrollment.id, |e| e.remove("contact deleted", now))
                .await
            {
                Ok(_) => removed += 1,
                // Concluded between the listing and the update.
                Err(crate::error::Error::Enrollment(EnrollmentError::InvalidTransition { .. })) => {}
                Err(e) => return Err(e),
            }
        }
        info!(contact_id = %contact_id, removed, "Contact enrollments removed");
        Ok(removed)
    }

    pub async fn list_flagged(&self, sequence_id: Uuid) -> Result<Vec<Enrollment>> {
        self.get_sequence(sequence_id).await?;
        Ok(self.store.list_flagged(sequence_id).await?)
    }

    // ── Events ─────────────────────────────────────────────────────

    /// Apply a reply/bounce event and fire the matching automation.
    ///
    /// Redelivery of an event that already landed leaves the state alone. Its
    /// trigger reports `Duplicate` once the rule has run; if an earlier
    /// delivery failed in the contact store, the redelivery runs it again.
    pub async fn ingest_event(&self, event: EngagementEvent, now: DateTime<Utc>) -> Result<EventOutcome> {
        let target = event.event_kind.target_state();
        let current = self.get_enrollment(event.enrollment_id).await?;

        let enrollment = if current.state == target {
            current
        } else {
            self.update_enrollment(event.enrollment_id, |e| {
                if e.state == target {
                    return Ok(());
                }
                e.apply_event(event.event_kind, now)
            })
            .await?
        };

        let sequence = self.get_sequence(enrollment.sequence_id).await?;
        let trigger = self
            .scheduler
            .automation()
            .apply_trigger(&sequence, &enrollment, event.event_kind.trigger(), now)
            .await?;

        info!(
            enrollment_id = %enrollment.id,
            event = ?event.event_kind,
            state = %enrollment.state,
            trigger = ?trigger,
            "Engagement event ingested"
        );
        Ok(EventOutcome {
            enrollment,
            trigger,
        })
    }

    // ── Sender limits ──────────────────────────────────────────────

    /// Store new limits; returns how many deferred enrollments were pulled forward.
    pub async fn set_rate_limits(
        &self,
        sender_id: &str,
        config: RateLimitConfig,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        self.limiter.set_limits(sender_id, config, now).await
    }

    pub async fn get_rate_limits(&self, sender_id: &str) -> Result<RateLimitConfig> {
        Ok(self
            .store
            .get_rate_limits(sender_id)
            .await?
            .unwrap_or_default())
    }
}
