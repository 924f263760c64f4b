//! Enrollment record and its transitions.
//!
//! Every mutation of an [`Enrollment`] goes through one of the methods here so
//! the state machine rules in [`EnrollmentState::can_transition_to`] hold and the
//! step pointer only ever moves forward.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::enrollment::state::{Deferral, EnrollmentState, EventKind};
use crate::error::EnrollmentError;
use crate::rate_limit::SendSchedule;
use crate::sequence::{Sequence, Step, TriggerKind};

/// One contact's progress through one sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Enrollment {
    pub id: Uuid,
    pub sequence_id: Uuid,
    pub contact_id: String,
    pub sender_id: String,
    pub state: EnrollmentState,
    /// Index of the step being executed (or waited on).
    pub current_step: usize,
    pub next_action_at: Option<DateTime<Utc>>,
    pub enrolled_at: DateTime<Utc>,
    pub last_action_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub deferral: Option<Deferral>,
    /// Set when a send needs a human to look at the contact data.
    pub review_reason: Option<String>,
    /// Why the enrollment was removed or bounced.
    pub status_reason: Option<String>,
    /// Triggers whose automation already ran.
    pub applied_triggers: BTreeSet<TriggerKind>,
    pub updated_at: DateTime<Utc>,
}

/// What the scheduler should do with an enrollment right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextMove<'a> {
    /// Run entering criteria.
    Admit,
    /// Send the email at the current step.
    Send {
        step: usize,
        subject: &'a str,
        body: &'a str,
    },
    /// Start waiting on the current step.
    Wait { days: u32 },
    /// The wait elapsed; move past it.
    Wake,
    /// No steps left.
    Complete,
    /// The grace period after completion ran out without a reply.
    ConcludeNoResponse,
    /// Nothing due.
    Idle,
}

impl Enrollment {
    /// A fresh enrollment awaiting admission.
    pub fn new(sequence: &Sequence, contact_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence_id: sequence.id,
            contact_id: contact_id.into(),
            sender_id: sequence.spec.sender_id.clone(),
            state: EnrollmentState::PendingEntry,
            current_step: 0,
            next_action_at: Some(now),
            enrolled_at: now,
            last_action_at: None,
            consecutive_failures: 0,
            deferral: None,
            review_reason: None,
            status_reason: None,
            applied_triggers: BTreeSet::new(),
            updated_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state.is_live() && self.next_action_at.is_some_and(|at| at <= now)
    }

    /// Decide the next move without mutating anything.
    pub fn next_move<'a>(&self, sequence: &'a Sequence, now: DateTime<Utc>) -> NextMove<'a> {
        if !self.is_due(now) {
            return NextMove::Idle;
        }
        match self.state {
            EnrollmentState::PendingEntry => NextMove::Admit,
            EnrollmentState::Active => match sequence.step(self.current_step) {
                None => NextMove::Complete,
                Some(Step::Email { subject, body }) => NextMove::Send {
                    step: self.current_step,
                    subject,
                    body,
                },
                Some(Step::Wait { days }) => NextMove::Wait { days: *days },
            },
            EnrollmentState::Waiting => NextMove::Wake,
            EnrollmentState::Completed => NextMove::ConcludeNoResponse,
            _ => NextMove::Idle,
        }
    }

    fn transition(
        &mut self,
        target: EnrollmentState,
        now: DateTime<Utc>,
    ) -> Result<(), EnrollmentError> {
        if !self.state.can_transition_to(target) {
            return Err(EnrollmentError::InvalidTransition {
                id: self.id,
                state: self.state.to_string(),
                target: target.to_string(),
            });
        }
        tracing::debug!(
            enrollment_id = %self.id,
            from = %self.state,
            to = %target,
            step = self.current_step,
            "Enrollment transition"
        );
        self.state = target;
        self.updated_at = now;
        if target.is_terminal() {
            self.next_action_at = None;
            self.deferral = None;
        }
        Ok(())
    }

    fn require(&self, expected: EnrollmentState, target: &str) -> Result<(), EnrollmentError> {
        if self.state != expected {
            return Err(EnrollmentError::InvalidTransition {
                id: self.id,
                state: self.state.to_string(),
                target: target.to_string(),
            });
        }
        Ok(())
    }

    /// `pending_entry → active`, due immediately.
    pub fn admit(&mut self, now: DateTime<Utc>) -> Result<(), EnrollmentError> {
        self.transition(EnrollmentState::Active, now)?;
        self.next_action_at = Some(now);
        Ok(())
    }

    /// `active → waiting` until `now + days`, landed on the next open window.
    pub fn begin_wait(
        &mut self,
        days: u32,
        schedule: &SendSchedule,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, EnrollmentError> {
        self.transition(EnrollmentState::Waiting, now)?;
        let raw = now + Duration::days(i64::from(days));
        let until = schedule.next_open(raw).unwrap_or(raw);
        self.next_action_at = Some(until);
        self.deferral = None;
        self.last_action_at = Some(now);
        Ok(until)
    }

    /// `waiting → active`; the pointer moves past the finished wait step.
    pub fn wake(&mut self, now: DateTime<Utc>) -> Result<(), EnrollmentError> {
        self.transition(EnrollmentState::Active, now)?;
        self.current_step += 1;
        self.next_action_at = Some(now);
        Ok(())
    }

    /// Record a delivered email and advance; completes when no steps remain.
    pub fn record_sent(
        &mut self,
        step_count: usize,
        no_response_grace: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), EnrollmentError> {
        self.require(EnrollmentState::Active, "active")?;
        self.current_step += 1;
        self.last_action_at = Some(now);
        self.consecutive_failures = 0;
        self.deferral = None;
        self.review_reason = None;
        self.updated_at = now;
        if self.current_step >= step_count {
            self.complete(no_response_grace, now)
        } else {
            self.next_action_at = Some(now);
            Ok(())
        }
    }

    /// `active → completed`; the no-response verdict is due after the grace period.
    pub fn complete(
        &mut self,
        no_response_grace: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), EnrollmentError> {
        self.transition(EnrollmentState::Completed, now)?;
        self.next_action_at = Some(now + no_response_grace);
        self.deferral = None;
        Ok(())
    }

    /// `completed → no_response`.
    pub fn conclude_no_response(&mut self, now: DateTime<Utc>) -> Result<(), EnrollmentError> {
        self.transition(EnrollmentState::NoResponse, now)
    }

    /// Push the next action back without changing state.
    pub fn defer(&mut self, until: DateTime<Utc>, reason: Deferral, now: DateTime<Utc>) {
        self.next_action_at = Some(until);
        self.deferral = Some(reason);
        self.updated_at = now;
    }

    /// Hold the send for manual review and retry at `retry_at`.
    pub fn flag_for_review(
        &mut self,
        reason: impl Into<String>,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        self.review_reason = Some(reason.into());
        self.defer(retry_at, Deferral::RenderBlocked, now);
    }

    /// Count a failed send. Returns `true` once `max_attempts` is reached and the
    /// enrollment has moved to `bounced`; otherwise it retries at `retry_at`.
    pub fn record_failure(
        &mut self,
        reason: impl Into<String>,
        max_attempts: u32,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, EnrollmentError> {
        self.require(EnrollmentState::Active, "active")?;
        self.consecutive_failures += 1;
        let reason = reason.into();
        if self.consecutive_failures >= max_attempts {
            self.transition(EnrollmentState::Bounced, now)?;
            self.status_reason = Some(format!(
                "send failed {} times: {reason}",
                self.consecutive_failures
            ));
            return Ok(true);
        }
        self.status_reason = Some(reason);
        self.defer(retry_at, Deferral::RetryBackoff, now);
        Ok(false)
    }

    /// Apply an external reply/bounce report.
    pub fn apply_event(&mut self, kind: EventKind, now: DateTime<Utc>) -> Result<(), EnrollmentError> {
        self.transition(kind.target_state(), now)
    }

    /// Move to `removed` (failed admission, unenroll, contact deletion).
    pub fn remove(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<(), EnrollmentError> {
        self.transition(EnrollmentState::Removed, now)?;
        self.status_reason = Some(reason.into());
        Ok(())
    }
}

/// Status view returned to the platform.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentStatus {
    #[serde(flatten)]
    pub enrollment: Enrollment,
    pub total_steps: usize,
    pub terminal: bool,
}
