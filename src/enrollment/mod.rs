//! Enrollment lifecycle: states, transitions and the per-contact record.

pub mod model;
pub mod state;

pub use model::{Enrollment, EnrollmentStatus, NextMove};
pub use state::{Deferral, EnrollmentState, EventKind};
