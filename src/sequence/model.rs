//! Sequence configuration: steps, entering criteria and automation rules.
//!
//! These are immutable value objects. A [`SequenceSpec`] is validated once at
//! the API boundary; anything that fails [`SequenceSpec::validate`] is rejected
//! before it reaches storage.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::contact::OutreachStatus;
use crate::error::ValidationError;
use crate::rate_limit::SendSchedule;
use crate::sequence::render;

/// Lifecycle of a sequence as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceStatus {
    Draft,
    Active,
    Paused,
}

impl SequenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Paused => "paused",
        }
    }
}

impl std::fmt::Display for SequenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SequenceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            other => Err(format!("unknown sequence status: {other}")),
        }
    }
}

/// Whether teammates can see the sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Team,
    Private,
}

/// One positional step of a sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    /// Send an email; subject and body may contain `{{placeholders}}`.
    Email { subject: String, body: String },
    /// Pause for a whole number of days.
    Wait { days: u32 },
}

impl Step {
    pub fn email(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self::Email {
            subject: subject.into(),
            body: body.into(),
        }
    }

    pub fn wait(days: u32) -> Self {
        Self::Wait { days }
    }
}

/// A predicate that only needs switching on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toggle {
    pub enabled: bool,
}

impl Toggle {
    pub fn on() -> Self {
        Self { enabled: true }
    }
}

/// A predicate with a comparison value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Criterion<T> {
    pub enabled: bool,
    #[serde(default)]
    pub value: T,
}

impl<T> Criterion<T> {
    pub fn on(value: T) -> Self {
        Self {
            enabled: true,
            value,
        }
    }
}

/// Admission filter, evaluated once when a contact enters the sequence.
///
/// Field order here is the evaluation order used by [`crate::criteria::admit`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnteringCriteria {
    pub profile_type: Criterion<String>,
    pub must_have_email: Toggle,
    pub must_have_verified_email: Toggle,
    pub allowed_statuses: Criterion<BTreeSet<OutreachStatus>>,
    pub must_have_company: Toggle,
    pub must_have_title: Toggle,
    pub in_list: Criterion<String>,
    pub has_tags: Criterion<BTreeSet<String>>,
}

impl EnteringCriteria {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let empty = |criterion: &str| ValidationError::InvalidCriterion {
            criterion: criterion.to_string(),
            reason: "has no value".to_string(),
        };
        if self.profile_type.enabled && self.profile_type.value.trim().is_empty() {
            return Err(empty("profileType"));
        }
        if self.allowed_statuses.enabled && self.allowed_statuses.value.is_empty() {
            return Err(empty("allowedStatuses"));
        }
        if self.in_list.enabled && self.in_list.value.trim().is_empty() {
            return Err(empty("inList"));
        }
        if self.has_tags.enabled && self.has_tags.value.is_empty() {
            return Err(empty("hasTags"));
        }
        Ok(())
    }
}

/// Lifecycle events an automation rule can react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TriggerKind {
    OnReplied,
    OnRepliedNotInterested,
    OnNoResponse,
    OnBounced,
}

impl TriggerKind {
    pub const ALL: [TriggerKind; 4] = [
        Self::OnReplied,
        Self::OnRepliedNotInterested,
        Self::OnNoResponse,
        Self::OnBounced,
    ];

    /// Outreach status written when the rule has `update_status` set.
    pub fn target_status(&self) -> OutreachStatus {
        match self {
            Self::OnReplied => OutreachStatus::Replied,
            Self::OnRepliedNotInterested => OutreachStatus::NotInterested,
            Self::OnNoResponse => OutreachStatus::NoResponse,
            Self::OnBounced => OutreachStatus::Bounced,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OnReplied => "onReplied",
            Self::OnRepliedNotInterested => "onRepliedNotInterested",
            Self::OnNoResponse => "onNoResponse",
            Self::OnBounced => "onBounced",
        }
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown trigger kind: {s}"))
    }
}

/// Side effects applied to the contact when a trigger fires.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AutomationRule {
    pub update_status: bool,
    pub move_to_list: Option<String>,
    pub add_tags: BTreeSet<String>,
}

impl AutomationRule {
    pub fn is_noop(&self) -> bool {
        !self.update_status && self.move_to_list.is_none() && self.add_tags.is_empty()
    }
}

pub type AutomationRules = BTreeMap<TriggerKind, AutomationRule>;

/// Everything a caller supplies to create or edit a sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceSpec {
    pub organization_id: String,
    /// User whose mailbox and sending quota the sequence uses.
    pub sender_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub entering_criteria: EnteringCriteria,
    #[serde(default)]
    pub automation: AutomationRules,
    /// Window used to land wait steps on business hours.
    #[serde(default)]
    pub send_schedule: SendSchedule,
    #[serde(default)]
    pub visibility: Visibility,
}

impl SequenceSpec {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if self.steps.is_empty() {
            return Err(ValidationError::NoSteps);
        }
        for (idx, step) in self.steps.iter().enumerate() {
            match step {
                Step::Email { subject, body } => {
                    if subject.trim().is_empty() {
                        return Err(ValidationError::EmptySubject { step: idx });
                    }
                    if body.trim().is_empty() {
                        return Err(ValidationError::EmptyBody { step: idx });
                    }
                    let malformed = render::malformed_placeholder(subject)
                        .or_else(|| render::malformed_placeholder(body));
                    if let Some(fragment) = malformed {
                        return Err(ValidationError::MalformedPlaceholder { step: idx, fragment });
                    }
                    let unknown = render::placeholders(subject)
                        .chain(render::placeholders(body))
                        .find(|t| !render::is_known_token(t));
                    if let Some(token) = unknown {
                        return Err(ValidationError::UnknownPlaceholder {
                            step: idx,
                            token: token.to_string(),
                        });
                    }
                }
                Step::Wait { days } => {
                    if *days < 1 {
                        return Err(ValidationError::WaitTooShort {
                            step: idx,
                            days: *days,
                        });
                    }
                }
            }
        }
        self.entering_criteria.validate()?;
        self.send_schedule.validate()?;
        Ok(())
    }
}

/// A persisted sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sequence {
    pub id: Uuid,
    pub status: SequenceStatus,
    #[serde(flatten)]
    pub spec: SequenceSpec,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Sequence {
    /// Validate `spec` and build a new draft sequence from it.
    pub fn create(spec: SequenceSpec, now: DateTime<Utc>) -> Result<Self, ValidationError> {
        spec.validate()?;
        Ok(Self {
            id: Uuid::new_v4(),
            status: SequenceStatus::Draft,
            spec,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn step(&self, index: usize) -> Option<&Step> {
        self.spec.steps.get(index)
    }

    pub fn step_count(&self) -> usize {
        self.spec.steps.len()
    }

    pub fn rule(&self, kind: TriggerKind) -> Option<&AutomationRule> {
        self.spec.automation.get(&kind)
    }

    pub fn is_running(&self) -> bool {
        self.status == SequenceStatus::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(steps: Vec<Step>) -> SequenceSpec {
        SequenceSpec {
            organization_id: "org-1".into(),
            sender_id: "sender-1".into(),
            name: "Intro".into(),
            description: String::new(),
            steps,
            entering_criteria: EnteringCriteria::default(),
            automation: AutomationRules::new(),
            send_schedule: SendSchedule::default(),
            visibility: Visibility::Team,
        }
    }

    #[test]
    fn valid_spec_passes() {
        let spec = spec(vec![
            Step::email("Hi {{firstName}}", "Body"),
            Step::wait(2),
            Step::email("Follow-up", "Still at {{company}}?"),
        ]);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn rejects_empty_steps() {
        assert_eq!(spec(vec![]).validate(), Err(ValidationError::NoSteps));
    }

    #[test]
    fn rejects_email_without_subject_or_body() {
        assert_eq!(
            spec(vec![Step::email("  ", "Body")]).validate(),
            Err(ValidationError::EmptySubject { step: 0 })
        );
        assert_eq!(
            spec(vec![Step::wait(1), Step::email("Hi", "")]).validate(),
            Err(ValidationError::EmptyBody { step: 1 })
        );
    }

    #[test]
    fn rejects_zero_day_wait() {
        assert_eq!(
            spec(vec![Step::email("Hi", "Body"), Step::wait(0)]).validate(),
            Err(ValidationError::WaitTooShort { step: 1, days: 0 })
        );
    }

    #[test]
    fn rejects_unknown_placeholder() {
        let err = spec(vec![Step::email("Hi {{nickname}}", "Body")])
            .validate()
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnknownPlaceholder {
                step: 0,
                token: "nickname".into()
            }
        );
        assert_eq!(err.to_string(), "step 0: unknown placeholder '{{nickname}}'");
    }

    #[test]
    fn rejects_malformed_placeholder() {
        assert_eq!(
            spec(vec![Step::email("Hi {{first-name}}", "Body")]).validate(),
            Err(ValidationError::MalformedPlaceholder {
                step: 0,
                fragment: "{{first-name}}".into()
            })
        );
        assert_eq!(
            spec(vec![Step::email("Hi", "Hello {{ first name }}")]).validate(),
            Err(ValidationError::MalformedPlaceholder {
                step: 0,
                fragment: "{{ first name }}".into()
            })
        );
        assert!(spec(vec![Step::email("Hi {{ firstName }}", "Body")]).validate().is_ok());
    }

    #[test]
    fn rejects_enabled_criterion_without_value() {
        let mut spec = spec(vec![Step::email("Hi", "Body")]);
        spec.entering_criteria.has_tags = Criterion::on(BTreeSet::new());
        assert!(matches!(
            spec.validate(),
            Err(ValidationError::InvalidCriterion { ref criterion, .. }) if criterion == "hasTags"
        ));
    }

    #[test]
    fn disabled_criterion_may_be_empty() {
        let mut spec = spec(vec![Step::email("Hi", "Body")]);
        spec.entering_criteria.in_list = Criterion {
            enabled: false,
            value: String::new(),
        };
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn new_sequences_start_as_draft() {
        let seq = Sequence::create(spec(vec![Step::email("Hi", "Body")]), Utc::now()).unwrap();
        assert_eq!(seq.status, SequenceStatus::Draft);
        assert!(!seq.is_running());
    }

    #[test]
    fn spec_round_trips_through_json() {
        let mut original = spec(vec![
            Step::email("Hi {{firstName}}", "Body"),
            Step::wait(2),
            Step::email("Again", "Body 2"),
        ]);
        original.entering_criteria.must_have_email = Toggle::on();
        original.entering_criteria.allowed_statuses =
            Criterion::on(BTreeSet::from([OutreachStatus::NotContacted]));
        original.automation.insert(
            TriggerKind::OnBounced,
            AutomationRule {
                update_status: true,
                move_to_list: Some("Bounced".into()),
                add_tags: BTreeSet::from(["dead".to_string()]),
            },
        );

        let json = serde_json::to_string(&original).unwrap();
        let back: SequenceSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back.steps, original.steps);
        assert_eq!(back.entering_criteria, original.entering_criteria);
        assert_eq!(back.automation, original.automation);
        assert_eq!(back, original);
    }

    #[test]
    fn wire_format_uses_product_names() {
        let mut spec = spec(vec![Step::wait(3)]);
        spec.automation
            .insert(TriggerKind::OnRepliedNotInterested, AutomationRule::default());
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["steps"][0], serde_json::json!({"type": "wait", "days": 3}));
        assert!(json["automation"].get("onRepliedNotInterested").is_some());
        assert!(json["enteringCriteria"].get("mustHaveVerifiedEmail").is_some());
    }

    #[test]
    fn trigger_targets() {
        assert_eq!(TriggerKind::OnReplied.target_status(), OutreachStatus::Replied);
        assert_eq!(
            TriggerKind::OnRepliedNotInterested.target_status(),
            OutreachStatus::NotInterested
        );
        assert_eq!(TriggerKind::OnNoResponse.target_status(), OutreachStatus::NoResponse);
        assert_eq!(TriggerKind::OnBounced.target_status(), OutreachStatus::Bounced);
        assert_eq!("onBounced".parse::<TriggerKind>(), Ok(TriggerKind::OnBounced));
    }
}
