//! Sequence configuration and email rendering.

pub mod model;
pub mod render;

pub use model::{
    AutomationRule, AutomationRules, Criterion, EnteringCriteria, Sequence, SequenceSpec,
    SequenceStatus, Step, Toggle, TriggerKind, Visibility,
};
pub use render::{RenderedEmail, render_email};
