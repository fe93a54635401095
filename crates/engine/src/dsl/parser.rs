//! Definition parsing and graph validation

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use super::model::{StepDsl, StepSpec, WorkflowDsl, MAX_DELAY_SECONDS};

/// Reasons a workflow definition is rejected
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DslError {
    /// Not JSON, wrong shape, missing required field or unknown step type
    #[error("malformed workflow definition: {0}")]
    Malformed(String),

    #[error("workflow requires at least one step")]
    NoSteps,

    #[error("duplicate step id: {0}")]
    DuplicateStepId(String),

    #[error("step {step} has an empty {field}")]
    EmptyField { step: String, field: &'static str },

    #[error("step {step} has an out of range {field}")]
    OutOfRange { step: String, field: &'static str },

    #[error("step {step} points to missing next step {target}")]
    UnknownNext { step: String, target: String },

    #[error("condition step {step} points to missing branch step {target}")]
    UnknownBranch { step: String, target: String },

    #[error("cycle detected at step {0}")]
    Cycle(String),
}

/// Parse and validate a workflow definition document
///
/// No partial graph is ever returned: any structural problem fails the whole
/// parse.
pub fn parse(text: &str) -> Result<WorkflowDsl, DslError> {
    let dsl: WorkflowDsl =
        serde_json::from_str(text).map_err(|e| DslError::Malformed(e.to_string()))?;
    validate(&dsl)?;
    Ok(dsl)
}

/// Validate an already deserialized definition
pub fn validate(dsl: &WorkflowDsl) -> Result<(), DslError> {
    if dsl.steps.is_empty() {
        return Err(DslError::NoSteps);
    }

    let mut ids = HashSet::with_capacity(dsl.steps.len());
    for step in &dsl.steps {
        if !ids.insert(step.id.as_str()) {
            return Err(DslError::DuplicateStepId(step.id.clone()));
        }
    }

    for step in &dsl.steps {
        check_required_fields(step)?;

        if let Some(next) = &step.next {
            if !ids.contains(next.as_str()) {
                return Err(DslError::UnknownNext {
                    step: step.id.clone(),
                    target: next.clone(),
                });
            }
        }

        if let StepSpec::Condition(c) = &step.spec {
            for target in [&c.true_next, &c.false_next] {
                if !ids.contains(target.as_str()) {
                    return Err(DslError::UnknownBranch {
                        step: step.id.clone(),
                        target: target.clone(),
                    });
                }
            }
        }
    }

    detect_cycle(dsl)
}

fn check_required_fields(step: &StepDsl) -> Result<(), DslError> {
    let required: Vec<(&'static str, &str)> = match &step.spec {
        StepSpec::Ai(s) => vec![
            ("provider", s.provider.as_str()),
            ("model", s.model.as_str()),
            ("promptTemplate", s.prompt_template.as_str()),
        ],
        StepSpec::Http(s) => vec![("method", s.method.as_str()), ("url", s.url.as_str())],
        StepSpec::Condition(s) => vec![
            ("expression", s.expression.as_str()),
            ("trueNext", s.true_next.as_str()),
            ("falseNext", s.false_next.as_str()),
        ],
        StepSpec::Delay(s) => {
            if s.delay_seconds.is_some_and(|secs| secs > MAX_DELAY_SECONDS) {
                return Err(DslError::OutOfRange {
                    step: step.id.clone(),
                    field: "delaySeconds",
                });
            }
            vec![]
        }
        StepSpec::QueuePublish(s) => vec![
            ("topic", s.topic.as_str()),
            ("routingKey", s.routing_key.as_str()),
        ],
    };

    let id_check = std::iter::once(("id", step.id.as_str()));
    match id_check
        .chain(required)
        .find(|(_, value)| value.trim().is_empty())
    {
        Some((field, _)) => Err(DslError::EmptyField {
            step: step.id.clone(),
            field,
        }),
        None => Ok(()),
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    OnStack,
    Done,
}

/// Depth-first walk with an explicit recursion stack
///
/// The walk starts at the first declared step and then continues from every
/// step not reached yet, so unreachable cycles are rejected too.
fn detect_cycle(dsl: &WorkflowDsl) -> Result<(), DslError> {
    let edges: HashMap<&str, Vec<&str>> = dsl
        .steps
        .iter()
        .map(|s| (s.id.as_str(), s.successors()))
        .collect();

    let mut marks: HashMap<&str, Mark> = HashMap::with_capacity(edges.len());

    for root in dsl.steps.iter().map(|s| s.id.as_str()) {
        if marks.contains_key(root) {
            continue;
        }

        // (node, index of the next edge to explore)
        let mut stack: Vec<(&str, usize)> = vec![(root, 0)];
        marks.insert(root, Mark::OnStack);

        while let Some((node, edge)) = stack.last_mut() {
            let successors = edges.get(*node).map(Vec::as_slice).unwrap_or_default();
            if let Some(&target) = successors.get(*edge) {
                *edge += 1;
                match marks.get(target) {
                    Some(Mark::OnStack) => return Err(DslError::Cycle(target.to_string())),
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(target, Mark::OnStack);
                        stack.push((target, 0));
                    }
                }
            } else {
                marks.insert(*node, Mark::Done);
                stack.pop();
            }
        }
    }

    Ok(())
}
