//! Workflow definition language
//!
//! This module provides:
//! - [`WorkflowDsl`] and [`StepDsl`] - the typed step graph
//! - [`parse`] - JSON parsing plus structural validation (ids, references, cycles)

mod model;
mod parser;

pub use model::{
    AiStep, ConditionStep, DelayStep, HttpStep, QueuePublishStep, StepDsl, StepKind, StepSpec,
    TriggerDsl, WorkflowDsl, DEFAULT_STEP_TIMEOUT_SECONDS, MAX_DELAY_SECONDS,
    UNNAMED_WORKFLOW,
};
pub use parser::{parse, validate, DslError};
