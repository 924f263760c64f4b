//! Contact snapshot as read from the external lead store.
//!
//! The engine never owns contacts: it reads a point-in-time snapshot when it
//! needs one and writes back only through [`crate::collaborators::ContactStore`].

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Contact-level outreach status kept by the lead store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutreachStatus {
    NotContacted,
    Contacted,
    Replied,
    Interested,
    NotInterested,
    MeetingBooked,
    NoResponse,
    Bounced,
    DoNotContact,
}

impl OutreachStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotContacted => "not_contacted",
            Self::Contacted => "contacted",
            Self::Replied => "replied",
            Self::Interested => "interested",
            Self::NotInterested => "not_interested",
            Self::MeetingBooked => "meeting_booked",
            Self::NoResponse => "no_response",
            Self::Bounced => "bounced",
            Self::DoNotContact => "do_not_contact",
        }
    }
}

impl std::fmt::Display for OutreachStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of one contact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContactSnapshot {
    pub id: String,
    pub profile_type: Option<String>,
    pub email: Option<String>,
    pub email_verified: bool,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company: Option<String>,
    pub title: Option<String>,
    pub outreach_status: Option<OutreachStatus>,
    pub lists: BTreeSet<String>,
    pub tags: BTreeSet<String>,
}

impl ContactSnapshot {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_email(mut self, email: impl Into<String>, verified: bool) -> Self {
        self.email = Some(email.into());
        self.email_verified = verified;
        self
    }

    pub fn with_name(mut self, first: impl Into<String>, last: impl Into<String>) -> Self {
        self.first_name = Some(first.into());
        self.last_name = Some(last.into());
        self
    }

    pub fn with_company(mut self, company: impl Into<String>) -> Self {
        self.company = Some(company.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_profile_type(mut self, profile_type: impl Into<String>) -> Self {
        self.profile_type = Some(profile_type.into());
        self
    }

    pub fn with_status(mut self, status: OutreachStatus) -> Self {
        self.outreach_status = Some(status);
        self
    }

    pub fn with_list(mut self, list: impl Into<String>) -> Self {
        self.lists.insert(list.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Email address, if present and not blank.
    pub fn email_address(&self) -> Option<&str> {
        non_blank(self.email.as_deref())
    }

    pub fn has_company(&self) -> bool {
        non_blank(self.company.as_deref()).is_some()
    }

    pub fn has_title(&self) -> bool {
        non_blank(self.title.as_deref()).is_some()
    }

    /// "First Last", or whichever half exists.
    pub fn full_name(&self) -> Option<String> {
        match (
            non_blank(self.first_name.as_deref()),
            non_blank(self.last_name.as_deref()),
        ) {
            (Some(first), Some(last)) => Some(format!("{first} {last}")),
            (Some(one), None) | (None, Some(one)) => Some(one.to_string()),
            (None, None) => None,
        }
    }
}

pub(crate) fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
