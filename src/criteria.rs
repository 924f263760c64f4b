//! Entering-criteria evaluation.
//!
//! [`admit`] is a pure function of a contact snapshot and a criteria set. Enabled
//! predicates are checked in a fixed order (the field order of
//! [`EnteringCriteria`]) and the first failure becomes the skip reason:
//!
//! 1. profile type equality
//! 2. email present
//! 3. verified email present
//! 4. outreach status in the allowed set
//! 5. company present
//! 6. title present
//! 7. list membership
//! 8. tag superset

use serde::Serialize;

use crate::contact::ContactSnapshot;
use crate::sequence::EnteringCriteria;

/// Result of evaluating a contact against entering criteria.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Admission {
    pub admitted: bool,
    /// Why the contact was rejected; `None` when admitted.
    pub reason: Option<String>,
}

impl Admission {
    fn admitted() -> Self {
        Self {
            admitted: true,
            reason: None,
        }
    }

    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            admitted: false,
            reason: Some(reason.into()),
        }
    }
}

/// Evaluate `contact` against `criteria`, stopping at the first failing predicate.
pub fn admit(contact: &ContactSnapshot, criteria: &EnteringCriteria) -> Admission {
    match first_rejection(contact, criteria) {
        Some(reason) => Admission::rejected(reason),
        None => Admission::admitted(),
    }
}

fn first_rejection(contact: &ContactSnapshot, criteria: &EnteringCriteria) -> Option<String> {
    if criteria.profile_type.enabled {
        let expected = criteria.profile_type.value.as_str();
        let actual = contact.profile_type.as_deref();
        if actual != Some(expected) {
            return Some(format!(
                "profile type is '{}', expected '{}'",
                actual.unwrap_or("none"),
                expected
            ));
        }
    }

    if criteria.must_have_email.enabled && contact.email_address().is_none() {
        return Some("missing email".into());
    }

    if criteria.must_have_verified_email.enabled
        && (contact.email_address().is_none() || !contact.email_verified)
    {
        return Some("missing verified email".into());
    }

    if criteria.allowed_statuses.enabled {
        let allowed = contact
            .outreach_status
            .is_some_and(|s| criteria.allowed_statuses.value.contains(&s));
        if !allowed {
            let status = contact
                .outreach_status
                .map(|s| s.as_str())
                .unwrap_or("none");
            return Some(format!("outreach status '{status}' is not allowed"));
        }
    }

    if criteria.must_have_company.enabled && !contact.has_company() {
        return Some("missing company".into());
    }

    if criteria.must_have_title.enabled && !contact.has_title() {
        return Some("missing title".into());
    }

    if criteria.in_list.enabled && !contact.lists.contains(criteria.in_list.value.trim()) {
        return Some(format!("not in list '{}'", criteria.in_list.value.trim()));
    }

    if criteria.has_tags.enabled {
        let missing: Vec<&str> = criteria
            .has_tags
            .value
            .iter()
            .filter(|tag| !contact.tags.contains(*tag))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Some(format!("missing tags: {}", missing.join(", ")));
        }
    }

    None
}
