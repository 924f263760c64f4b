//! Outreach sequence engine: timed email sequences under per-sender quotas.

pub mod api;
pub mod automation;
pub mod collaborators;
pub mod config;
pub mod contact;
pub mod criteria;
pub mod engine;
pub mod enrollment;
pub mod error;
pub mod rate_limit;
pub mod scheduler;
pub mod sequence;
pub mod store;
