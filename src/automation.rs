//! Automation rules fired on enrollment outcomes.
//!
//! Triggers live in a durable outbox. The store queues a trigger in the same
//! write that moves an enrollment into an outcome state; this module claims the
//! row, runs the rule's side effects and only then marks it applied. A failed
//! side effect leaves the row pending for the next attempt. The contact-store
//! writes are set operations, so repeating them after a partial failure is safe:
//! - `updateStatus` writes the trigger's target outreach status
//! - `moveToList` adds the contact to a list (other lists are kept)
//! - `addTags` unions tags into the contact's tag set

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::collaborators::ContactStore;
use crate::enrollment::Enrollment;
use crate::error::Result;
use crate::sequence::{Sequence, TriggerKind};
use crate::store::{Database, PendingTrigger, TriggerClaim};

/// What happened when a trigger was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOutcome {
    /// The rule's side effects ran and the trigger is done.
    Applied,
    /// Already applied for this enrollment; nothing ran.
    Duplicate,
    /// Another worker is applying it right now.
    InFlight,
    /// The sequence has no effective rule for this trigger; marked done.
    NoRule,
}

/// A pending trigger that failed again during a retry sweep.
#[derive(Debug, Clone)]
pub struct FailedTrigger {
    pub sequence_id: Uuid,
    pub enrollment_id: Uuid,
    pub contact_id: String,
    pub kind: TriggerKind,
    pub reason: String,
}

/// Totals from one retry sweep.
#[derive(Debug, Clone, Default)]
pub struct RetrySweep {
    pub applied: usize,
    pub failed: Vec<FailedTrigger>,
}

/// Applies a sequence's automation rules to the contact store.
pub struct AutomationEngine {
    store: Arc<dyn Database>,
    contacts: Arc<dyn ContactStore>,
    claim_ttl: chrono::Duration,
}

impl AutomationEngine {
    pub fn new(
        store: Arc<dyn Database>,
        contacts: Arc<dyn ContactStore>,
        claim_ttl: chrono::Duration,
    ) -> Self {
        Self {
            store,
            contacts,
            claim_ttl,
        }
    }

    pub async fn apply_trigger(
        &self,
        sequence: &Sequence,
        enrollment: &Enrollment,
        kind: TriggerKind,
        now: DateTime<Utc>,
    ) -> Result<TriggerOutcome> {
        self.store.enqueue_trigger(enrollment.id, kind, now).await?;

        let token = Uuid::new_v4();
        match self
            .store
            .claim_trigger(enrollment.id, kind, token, now + self.claim_ttl, now)
            .await?
        {
            TriggerClaim::Claimed => {}
            TriggerClaim::Applied => {
                debug!(enrollment_id = %enrollment.id, trigger = %kind, "Trigger already applied");
                return Ok(TriggerOutcome::Duplicate);
            }
            TriggerClaim::Busy => {
                debug!(enrollment_id = %enrollment.id, trigger = %kind, "Trigger held by another worker");
                return Ok(TriggerOutcome::InFlight);
            }
        }

        let outcome = match self.run_rule(sequence, enrollment, kind).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    enrollment_id = %enrollment.id,
                    trigger = %kind,
                    error = %e,
                    "Automation side effects failed; trigger stays pending"
                );
                if let Err(db) = self
                    .store
                    .fail_trigger(enrollment.id, kind, token, &e.to_string())
                    .await
                {
                    error!(enrollment_id = %enrollment.id, error = %db, "Failed to record trigger failure");
                }
                return Err(e);
            }
        };

        if !self
            .store
            .complete_trigger(enrollment.id, kind, token, now)
            .await?
        {
            warn!(enrollment_id = %enrollment.id, trigger = %kind, "Trigger claim expired before completion");
        }
        Ok(outcome)
    }

    async fn run_rule(
        &self,
        sequence: &Sequence,
        enrollment: &Enrollment,
        kind: TriggerKind,
    ) -> Result<TriggerOutcome> {
        let Some(rule) = sequence.rule(kind).filter(|r| !r.is_noop()) else {
            return Ok(TriggerOutcome::NoRule);
        };

        let contact_id = enrollment.contact_id.as_str();
        if rule.update_status {
            self.contacts
                .set_outreach_status(contact_id, kind.target_status())
                .await?;
        }
        if let Some(list) = rule.move_to_list.as_deref().filter(|l| !l.trim().is_empty()) {
            self.contacts.add_to_list(contact_id, list).await?;
        }
        if !rule.add_tags.is_empty() {
            self.contacts.add_tags(contact_id, &rule.add_tags).await?;
        }

        info!(
            enrollment_id = %enrollment.id,
            contact_id = %contact_id,
            trigger = %kind,
            "Automation rule applied"
        );
        Ok(TriggerOutcome::Applied)
    }

    /// Re-run every pending trigger with fewer than `max_attempts` failures.
    pub async fn retry_pending(&self, now: DateTime<Utc>, max_attempts: u32) -> Result<RetrySweep> {
        let pending = self.store.list_pending_triggers(now, max_attempts).await?;
        let mut sweep = RetrySweep::default();
        let mut sequences: HashMap<Uuid, Arc<Sequence>> = HashMap::new();

        for PendingTrigger {
            enrollment_id,
            kind,
            retry_count,
            ..
        } in pending
        {
            let Some(enrollment) = self.store.get_enrollment(enrollment_id).await? else {
                continue;
            };
            let sequence = match sequences.get(&enrollment.sequence_id) {
                Some(seq) => Arc::clone(seq),
                None => {
                    let Some(seq) = self.store.get_sequence(enrollment.sequence_id).await? else {
                        continue;
                    };
                    let seq = Arc::new(seq);
                    sequences.insert(seq.id, Arc::clone(&seq));
                    seq
                }
            };

            debug!(enrollment_id = %enrollment_id, trigger = %kind, retry_count, "Retrying trigger");
            match self.apply_trigger(&sequence, &enrollment, kind, now).await {
                Ok(TriggerOutcome::Applied | TriggerOutcome::NoRule) => sweep.applied += 1,
                Ok(_) => {}
                Err(e) => {
                    if retry_count + 1 >= max_attempts {
                        error!(
                            enrollment_id = %enrollment_id,
                            trigger = %kind,
                            attempts = retry_count + 1,
                            "Giving up on trigger"
                        );
                    }
                    sweep.failed.push(FailedTrigger {
                        sequence_id: sequence.id,
                        enrollment_id,
                        contact_id: enrollment.contact_id.clone(),
                        kind,
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(sweep)
    }
}
