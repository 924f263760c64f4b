//! `Database` trait: single async interface for all engine persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::enrollment::{Enrollment, EnrollmentState};
use crate::error::DatabaseError;
use crate::rate_limit::{DispatchRecord, RateLimitConfig};
use crate::sequence::{Sequence, TriggerKind};

/// Claim parameters for a conditional update of one enrollment.
#[derive(Debug, Clone)]
pub struct Claim {
    pub token: Uuid,
    /// The claim expires at this instant if its holder never saves.
    pub until: DateTime<Utc>,
    /// State the enrollment must still be in.
    pub expected_state: EnrollmentState,
    /// Next-action timestamp the enrollment must still carry.
    pub expected_next_action: Option<DateTime<Utc>>,
}

/// A trigger whose side effects have not completed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTrigger {
    pub enrollment_id: Uuid,
    pub kind: TriggerKind,
    /// Failed attempts so far.
    pub retry_count: u32,
    pub last_error: Option<String>,
}

/// Result of trying to take the claim on a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerClaim {
    Claimed,
    /// Side effects already completed.
    Applied,
    /// Another worker holds a live claim.
    Busy,
}

/// Backend-agnostic database trait covering sequences, enrollments and sender quotas.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Sequences ───────────────────────────────────────────────────

    async fn insert_sequence(&self, sequence: &Sequence) -> Result<(), DatabaseError>;

    async fn get_sequence(&self, id: Uuid) -> Result<Option<Sequence>, DatabaseError>;

    /// Overwrite status, spec and `updated_at`. Returns false if the row is gone.
    async fn update_sequence(&self, sequence: &Sequence) -> Result<bool, DatabaseError>;

    // ── Enrollments ─────────────────────────────────────────────────

    /// Insert a new enrollment. Returns false (and writes nothing) if the contact
    /// already has a live enrollment in the same sequence.
    async fn insert_enrollment(&self, enrollment: &Enrollment) -> Result<bool, DatabaseError>;

    async fn get_enrollment(&self, id: Uuid) -> Result<Option<Enrollment>, DatabaseError>;

    async fn list_enrollments(&self, sequence_id: Uuid) -> Result<Vec<Enrollment>, DatabaseError>;

    /// Live enrollments carrying a manual-review flag.
    async fn list_flagged(&self, sequence_id: Uuid) -> Result<Vec<Enrollment>, DatabaseError>;

    /// Live enrollments of one contact across all sequences.
    async fn list_live_for_contact(&self, contact_id: &str)
    -> Result<Vec<Enrollment>, DatabaseError>;

    /// Live, unclaimed enrollments of active sequences due at or before `now`,
    /// ordered by sender then next-action time.
    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Enrollment>, DatabaseError>;

    /// Take the processing claim. Returns false if the state or next-action
    /// changed, or another worker holds a live claim.
    async fn claim_enrollment(
        &self,
        id: Uuid,
        claim: &Claim,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Persist a claimed enrollment and drop the claim. Returns false if the
    /// claim was lost in the meantime; nothing is written then.
    async fn save_claimed(&self, enrollment: &Enrollment, token: Uuid)
    -> Result<bool, DatabaseError>;

    /// Drop a claim without writing anything else.
    async fn release_claim(&self, id: Uuid, token: Uuid) -> Result<(), DatabaseError>;

    /// Persist an enrollment only if it is still in `expected_state`. Clears any
    /// claim so an in-flight scheduler save is rejected.
    async fn save_if_state(
        &self,
        enrollment: &Enrollment,
        expected_state: EnrollmentState,
    ) -> Result<bool, DatabaseError>;

    /// Move every live, rate-deferred enrollment of `sender_id` due after
    /// `until` forward to `until`. Returns the number of rows touched.
    async fn reschedule_rate_deferred(
        &self,
        sender_id: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize, DatabaseError>;

    // ── Automation ──────────────────────────────────────────────────

    // Moving an enrollment into replied, replied_not_interested, no_response
    // or bounced queues the matching trigger in the same write.

    /// Queue `kind` for an enrollment unless it is already queued or applied.
    async fn enqueue_trigger(
        &self,
        enrollment_id: Uuid,
        kind: TriggerKind,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Take the claim on a pending trigger.
    async fn claim_trigger(
        &self,
        enrollment_id: Uuid,
        kind: TriggerKind,
        token: Uuid,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<TriggerClaim, DatabaseError>;

    /// Mark a claimed trigger applied. Returns false if the claim was lost.
    async fn complete_trigger(
        &self,
        enrollment_id: Uuid,
        kind: TriggerKind,
        token: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Record a failed attempt and drop the claim; the trigger stays pending.
    async fn fail_trigger(
        &self,
        enrollment_id: Uuid,
        kind: TriggerKind,
        token: Uuid,
        error: &str,
    ) -> Result<(), DatabaseError>;

    /// Unclaimed pending triggers with fewer than `max_attempts` failures, oldest first.
    async fn list_pending_triggers(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Vec<PendingTrigger>, DatabaseError>;

    // ── Sender quotas ───────────────────────────────────────────────

    async fn get_rate_limits(&self, sender_id: &str)
    -> Result<Option<RateLimitConfig>, DatabaseError>;

    async fn set_rate_limits(
        &self,
        sender_id: &str,
        config: &RateLimitConfig,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn insert_dispatch(&self, record: &DispatchRecord) -> Result<(), DatabaseError>;

    async fn delete_dispatch(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Send times of `sender_id` strictly after `since`, oldest first.
    async fn list_dispatch_times(
        &self,
        sender_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, DatabaseError>;

    /// Delete dispatch records at or before `before`.
    async fn prune_dispatches(&self, before: DateTime<Utc>) -> Result<usize, DatabaseError>;
}
