//! Persistent entities of the engine
//!
//! This module provides:
//! - [`WorkflowDefinition`] / [`WorkflowVersion`] - authored workflows, append-only versions
//! - [`WorkflowInstance`] - one execution and its state transitions
//! - [`StepExecution`] - one attempt of one step
//! - [`DeadLetterMessage`] / [`OutboxMessage`] - failure snapshots and staged events

mod definition;
mod instance;
mod messages;
mod step_execution;

pub use definition::{content_hash, WorkflowDefinition, WorkflowVersion};
pub use instance::{
    ContextMap, InstanceError, InstanceStatus, NewInstance, TriggerType, WorkflowInstance,
};
pub use messages::{DeadLetterMessage, OutboxMessage};
pub use step_execution::{StepExecution, StepStatus};
