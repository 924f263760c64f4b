//! Placeholder rendering for email steps.
//!
//! Tokens look like `{{firstName}}` (surrounding whitespace inside the braces is
//! allowed). Every token must resolve against the contact; a missing value is a
//! [`RenderError`], never an empty substitution.

use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::contact::{ContactSnapshot, non_blank};
use crate::error::RenderError;

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").unwrap_or_else(|e| {
        panic!("placeholder regex failed to compile: {e}")
    })
});

static BRACES_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{[^{}]*\}\}").unwrap_or_else(|e| {
        panic!("brace regex failed to compile: {e}")
    })
});

/// Token names the renderer can resolve.
pub const KNOWN_TOKENS: &[&str] = &["firstName", "lastName", "fullName", "email", "company", "title"];

/// Subject and body with every placeholder resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub body: String,
}

/// Token names referenced by `text`, in order of appearance.
pub fn placeholders(text: &str) -> impl Iterator<Item = &str> {
    TOKEN_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
}

pub fn is_known_token(token: &str) -> bool {
    KNOWN_TOKENS.contains(&token)
}

/// First brace fragment in `text` that is not a well-formed `{{token}}`.
///
/// Catches `{{first-name}}`, `{{ first name }}` and unpaired `{{` / `}}`.
pub fn malformed_placeholder(text: &str) -> Option<String> {
    let bad = BRACES_RE.find_iter(text).find(|m| {
        !TOKEN_RE
            .find(m.as_str())
            .is_some_and(|t| t.range() == (0..m.as_str().len()))
    });
    if let Some(m) = bad {
        return Some(m.as_str().to_string());
    }

    let stripped = TOKEN_RE.replace_all(text, "");
    let at = [stripped.find("{{"), stripped.find("}}")]
        .into_iter()
        .flatten()
        .min()?;
    Some(stripped[at..].chars().take(24).collect())
}

fn resolve(token: &str, contact: &ContactSnapshot) -> Result<String, RenderError> {
    let value = match token {
        "firstName" => non_blank(contact.first_name.as_deref()).map(str::to_string),
        "lastName" => non_blank(contact.last_name.as_deref()).map(str::to_string),
        "fullName" => contact.full_name(),
        "email" => contact.email_address().map(str::to_string),
        "company" => non_blank(contact.company.as_deref()).map(str::to_string),
        "title" => non_blank(contact.title.as_deref()).map(str::to_string),
        other => {
            return Err(RenderError::UnknownToken {
                token: other.to_string(),
            });
        }
    };
    value.ok_or_else(|| RenderError::MissingField {
        contact_id: contact.id.clone(),
        token: token.to_string(),
    })
}

/// Resolve all placeholders in `text`; fails on the first unresolvable one.
pub fn render_text(text: &str, contact: &ContactSnapshot) -> Result<String, RenderError> {
    if let Some(fragment) = malformed_placeholder(text) {
        return Err(RenderError::MalformedPlaceholder { fragment });
    }
    let mut failure = None;
    let rendered = TOKEN_RE.replace_all(text, |caps: &Captures<'_>| {
        let token = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        match resolve(token, contact) {
            Ok(value) => value,
            Err(e) => {
                failure.get_or_insert(e);
                String::new()
            }
        }
    });
    match failure {
        Some(e) => Err(e),
        None => Ok(rendered.into_owned()),
    }
}

pub fn render_email(
    subject: &str,
    body: &str,
    contact: &ContactSnapshot,
) -> Result<RenderedEmail, RenderError> {
    Ok(RenderedEmail {
        subject: render_text(subject, contact)?,
        body: render_text(body, contact)?,
    })
}
