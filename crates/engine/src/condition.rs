//! Branch conditions
//!
//! Condition steps choose between two successors by evaluating a boolean
//! expression over the instance's context map. Only scalar entries of the
//! map are visible to expressions; nested objects and arrays are hidden.

use serde_json::{Map, Value};

use crate::domain::ContextMap;

/// Errors that can occur during condition evaluation
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConditionError {
    #[error("condition evaluation failed: {0}")]
    Evaluation(String),

    #[error("condition did not evaluate to a boolean: got {0}")]
    NotBoolean(Value),
}

/// Evaluates a condition expression against context data
pub trait ConditionEvaluator: Send + Sync + 'static {
    fn evaluate(&self, expression: &str, data: &ContextMap) -> Result<bool, ConditionError>;
}

/// JEXL-backed evaluator
///
/// ```
/// use stepflow_engine::condition::{ConditionEvaluator, JexlConditionEvaluator};
/// use stepflow_engine::domain::ContextMap;
///
/// let mut data = ContextMap::new();
/// data.insert("priority".into(), serde_json::json!(3));
///
/// let evaluator = JexlConditionEvaluator::new();
/// assert!(evaluator.evaluate("priority > 2", &data).unwrap());
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JexlConditionEvaluator;

impl JexlConditionEvaluator {
    pub fn new() -> Self {
        Self
    }

    fn scalar_view(data: &ContextMap) -> Value {
        let visible: Map<String, Value> = data
            .iter()
            .filter(|(_, v)| !(v.is_object() || v.is_array()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Value::Object(visible)
    }

    fn coerce(value: Value) -> Result<bool, ConditionError> {
        match &value {
            Value::Bool(b) => Ok(*b),
            Value::Null => Ok(false),
            Value::Number(n) => Ok(n.as_f64().is_some_and(|f| f != 0.0)),
            Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(true),
            Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(false),
            _ => Err(ConditionError::NotBoolean(value)),
        }
    }
}

impl ConditionEvaluator for JexlConditionEvaluator {
    fn evaluate(&self, expression: &str, data: &ContextMap) -> Result<bool, ConditionError> {
        let context = Self::scalar_view(data);
        let result = jexl_eval::Evaluator::new()
            .eval_in_context(expression, &context)
            .map_err(|e| ConditionError::Evaluation(e.to_string()))?;
        Self::coerce(result)
    }
}
