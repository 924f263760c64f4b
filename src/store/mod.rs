//! Persistence layer: libSQL-backed storage for sequences, enrollments and sender quotas.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Claim, Database, PendingTrigger, TriggerClaim};
