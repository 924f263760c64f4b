//! Error types for the outreach engine.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Enrollment error: {0}")]
    Enrollment(#[from] EnrollmentError),

    #[error("Contact store error: {0}")]
    ContactStore(#[from] ContactStoreError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Rejections raised while validating configuration at the API boundary.
///
/// Nothing that fails validation is ever persisted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("sequence name must not be empty")]
    EmptyName,

    #[error("sequence must contain at least one step")]
    NoSteps,

    #[error("step {step}: email subject must not be empty")]
    EmptySubject { step: usize },

    #[error("step {step}: email body must not be empty")]
    EmptyBody { step: usize },

    #[error("step {step}: wait must be at least 1 day, got {days}")]
    WaitTooShort { step: usize, days: u32 },

    #[error("step {step}: unknown placeholder '{{{{{token}}}}}'")]
    UnknownPlaceholder { step: usize, token: String },

    #[error("step {step}: malformed placeholder '{fragment}'")]
    MalformedPlaceholder { step: usize, fragment: String },

    #[error("criterion '{criterion}' is enabled but {reason}")]
    InvalidCriterion { criterion: String, reason: String },

    #[error("{field} must be between {min} and {max}, got {value}")]
    LimitOutOfRange {
        field: String,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("send window for {day}: {reason}")]
    InvalidWindow { day: String, reason: String },

    #[error("send window must enable at least one weekday")]
    NoSendDays,
}

/// Enrollment lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum EnrollmentError {
    #[error("Enrollment {id} not found")]
    NotFound { id: Uuid },

    #[error("Sequence {id} not found")]
    SequenceNotFound { id: Uuid },

    #[error("Enrollment {id} in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },

    #[error("Sequence {id} is {status}, expected {expected}")]
    InvalidSequenceStatus {
        id: Uuid,
        status: String,
        expected: String,
    },
}

/// Placeholder resolution failures; the send is held back, never sent with raw tokens.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("contact {contact_id} has no value for '{{{{{token}}}}}'")]
    MissingField { contact_id: String, token: String },

    #[error("unknown placeholder '{{{{{token}}}}}'")]
    UnknownToken { token: String },

    #[error("malformed placeholder '{fragment}'")]
    MalformedPlaceholder { fragment: String },
}

/// Failures reported by the external mail sender.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("send to contact {contact_id} failed: {reason}")]
    Failed { contact_id: String, reason: String },

    #[error("send to contact {contact_id} timed out after {timeout:?}")]
    Timeout { contact_id: String, timeout: Duration },

    #[error("contact {contact_id} has no email address")]
    NoRecipient { contact_id: String },
}

/// Failures talking to the external contact/lead store.
#[derive(Debug, thiserror::Error)]
pub enum ContactStoreError {
    #[error("Contact {contact_id} not found")]
    NotFound { contact_id: String },

    #[error("Contact store request failed: {0}")]
    Request(String),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
