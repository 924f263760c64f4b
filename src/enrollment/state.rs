//! Enrollment state machine states.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::sequence::TriggerKind;

/// Lifecycle state of one (contact, sequence) enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentState {
    /// Created, waiting for the scheduler to run admission.
    PendingEntry,
    /// Due to execute its current step.
    Active,
    /// Sitting on a wait step until `next_action_at`.
    Waiting,
    /// All steps done; waiting out the no-response grace period.
    Completed,
    Replied,
    RepliedNotInterested,
    NoResponse,
    Bounced,
    Removed,
}

impl EnrollmentState {
    /// States the scheduler still drives.
    pub const LIVE: [EnrollmentState; 4] = [
        Self::PendingEntry,
        Self::Active,
        Self::Waiting,
        Self::Completed,
    ];

    /// States an external reply/bounce report may move out of.
    pub const EVENT_SOURCES: [EnrollmentState; 3] = [Self::Active, Self::Waiting, Self::Completed];

    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: EnrollmentState) -> bool {
        use EnrollmentState::*;

        matches!(
            (self, target),
            // From PendingEntry
            (PendingEntry, Active) | (PendingEntry, Removed) |
            // From Active
            (Active, Waiting) | (Active, Completed) |
            (Active, Replied) | (Active, RepliedNotInterested) |
            (Active, Bounced) | (Active, Removed) |
            // From Waiting
            (Waiting, Active) |
            (Waiting, Replied) | (Waiting, RepliedNotInterested) |
            (Waiting, Bounced) | (Waiting, Removed) |
            // From Completed (late reply/bounce, or the no-response verdict)
            (Completed, NoResponse) |
            (Completed, Replied) | (Completed, RepliedNotInterested) |
            (Completed, Bounced) | (Completed, Removed)
        )
    }

    /// Terminal states are never scheduled again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Replied
                | Self::RepliedNotInterested
                | Self::NoResponse
                | Self::Bounced
                | Self::Removed
        )
    }

    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingEntry => "pending_entry",
            Self::Active => "active",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Replied => "replied",
            Self::RepliedNotInterested => "replied_not_interested",
            Self::NoResponse => "no_response",
            Self::Bounced => "bounced",
            Self::Removed => "removed",
        }
    }
}

impl std::fmt::Display for EnrollmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnrollmentState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_entry" => Ok(Self::PendingEntry),
            "active" => Ok(Self::Active),
            "waiting" => Ok(Self::Waiting),
            "completed" => Ok(Self::Completed),
            "replied" => Ok(Self::Replied),
            "replied_not_interested" => Ok(Self::RepliedNotInterested),
            "no_response" => Ok(Self::NoResponse),
            "bounced" => Ok(Self::Bounced),
            "removed" => Ok(Self::Removed),
            other => Err(format!("unknown enrollment state: {other}")),
        }
    }
}

/// Why an enrollment's next action was pushed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Deferral {
    /// Sender's hourly or daily ceiling was reached.
    RateLimited,
    /// Outside the sender's business-hour window.
    OutsideWindow,
    /// A placeholder could not be resolved; flagged for review.
    RenderBlocked,
    /// Backing off after a failed send.
    RetryBackoff,
}

impl Deferral {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::OutsideWindow => "outside_window",
            Self::RenderBlocked => "render_blocked",
            Self::RetryBackoff => "retry_backoff",
        }
    }
}

impl FromStr for Deferral {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rate_limited" => Ok(Self::RateLimited),
            "outside_window" => Ok(Self::OutsideWindow),
            "render_blocked" => Ok(Self::RenderBlocked),
            "retry_backoff" => Ok(Self::RetryBackoff),
            other => Err(format!("unknown deferral: {other}")),
        }
    }
}

/// Externally reported engagement, delivered at-least-once by the event feed.
///
/// No-response is deliberately absent: it is the engine's own verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Replied,
    RepliedNotInterested,
    Bounced,
}

impl EventKind {
    pub fn target_state(&self) -> EnrollmentState {
        match self {
            Self::Replied => EnrollmentState::Replied,
            Self::RepliedNotInterested => EnrollmentState::RepliedNotInterested,
            Self::Bounced => EnrollmentState::Bounced,
        }
    }

    pub fn trigger(&self) -> TriggerKind {
        match self {
            Self::Replied => TriggerKind::OnReplied,
            Self::RepliedNotInterested => TriggerKind::OnRepliedNotInterested,
            Self::Bounced => TriggerKind::OnBounced,
        }
    }
}
