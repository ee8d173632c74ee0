//! Core data model: query definitions, scenarios and execution results.

use std::fmt;
use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::error::ErrorKind;

/// A typed bind parameter.
///
/// Values are checked when a definition is built, so a malformed parameter
/// never reaches the database driver.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Timestamp(NaiveDateTime),
}

impl ParameterValue {
    /// Convert a JSON scalar into a parameter.
    ///
    /// Strings stay text, whatever they look like; the server decides what
    /// type they are. Arrays and objects are rejected.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, String> {
        use serde_json::Value;

        match value {
            Value::Null => Ok(Self::Null),
            Value::Bool(b) => Ok(Self::Bool(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Self::Integer(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Self::Float(f))
                } else {
                    Err(format!("number out of range: {}", n))
                }
            }
            Value::String(s) => Ok(Self::Text(s.clone())),
            Value::Array(_) | Value::Object(_) => {
                Err(format!("nested value is not a valid parameter: {}", value))
            }
        }
    }

    /// Render as a SQL literal, for tools that cannot bind parameters.
    pub fn to_sql_literal(&self) -> String {
        match self {
            Self::Null => "NULL".to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Integer(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Text(s) => format!("'{}'", s.replace('\'', "''")),
            Self::Timestamp(ts) => format!("'{}'", ts.format("%Y-%m-%d %H:%M:%S%.f")),
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Integer(i) => write!(f, "{}", i),
            Self::Float(v) => write!(f, "{}", v),
            Self::Text(s) => write!(f, "\"{}\"", s),
            Self::Timestamp(ts) => write!(f, "{}", ts),
        }
    }
}

impl From<bool> for ParameterValue {
    fn from(v: bool) -> Self {
        ParameterValue::Bool(v)
    }
}

impl From<i32> for ParameterValue {
    fn from(v: i32) -> Self {
        ParameterValue::Integer(v as i64)
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        ParameterValue::Integer(v)
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        ParameterValue::Float(v)
    }
}

impl From<&str> for ParameterValue {
    fn from(v: &str) -> Self {
        ParameterValue::Text(v.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(v: String) -> Self {
        ParameterValue::Text(v)
    }
}

impl From<NaiveDateTime> for ParameterValue {
    fn from(v: NaiveDateTime) -> Self {
        ParameterValue::Timestamp(v)
    }
}

/// One positional parameter tuple.
pub type ParameterSet = Vec<ParameterValue>;

/// A query to benchmark. Immutable once placed in a catalog.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryDefinition {
    pub identifier: String,
    /// SQL with `%s` positional placeholders.
    pub sql_template: String,
    /// Empty means the query takes no parameters.
    pub parameter_sets: Vec<ParameterSet>,
    /// How many times each parameter set executes.
    pub repeat_count: u32,
    /// Relative selection frequency, external-tool path only.
    pub weight: Option<u32>,
}

impl QueryDefinition {
    pub fn new(identifier: impl Into<String>, sql_template: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            sql_template: sql_template.into(),
            parameter_sets: Vec::new(),
            repeat_count: 1,
            weight: None,
        }
    }

    /// Add one parameter tuple.
    pub fn parameter_set<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<ParameterValue>,
    {
        self.parameter_sets
            .push(values.into_iter().map(Into::into).collect());
        self
    }

    pub fn parameter_sets(mut self, sets: Vec<ParameterSet>) -> Self {
        self.parameter_sets = sets;
        self
    }

    pub fn repeat(mut self, count: u32) -> Self {
        self.repeat_count = count;
        self
    }

    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    /// Number of executions this definition contributes to a run.
    pub fn total_executions(&self) -> u64 {
        self.parameter_sets.len().max(1) as u64 * self.repeat_count as u64
    }
}

/// One (query, parameter set) pairing, executed `repeat_count` times.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionScenario {
    /// Position in the run's expansion.
    pub index: usize,
    pub query: Arc<QueryDefinition>,
    pub parameter_set: ParameterSet,
    pub scenario_label: String,
    pub repeat_count: u32,
}

impl ExecutionScenario {
    pub fn query_identifier(&self) -> &str {
        &self.query.identifier
    }
}

/// Outcome of a single execution.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub scenario: Arc<ExecutionScenario>,
    /// Query round trip only; excludes connection acquisition.
    pub duration_ms: f64,
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub row_count: Option<u64>,
    /// Time spent waiting for a pooled connection.
    pub acquire_wait_ms: f64,
}

impl ExecutionResult {
    pub fn success(
        scenario: Arc<ExecutionScenario>,
        duration_ms: f64,
        row_count: u64,
        acquire_wait_ms: f64,
    ) -> Self {
        Self {
            scenario,
            duration_ms,
            success: true,
            error_kind: None,
            error_message: None,
            row_count: Some(row_count),
            acquire_wait_ms,
        }
    }

    pub fn failure(
        scenario: Arc<ExecutionScenario>,
        duration_ms: f64,
        kind: ErrorKind,
        message: impl Into<String>,
        acquire_wait_ms: f64,
    ) -> Self {
        Self {
            scenario,
            duration_ms,
            success: false,
            error_kind: Some(kind),
            error_message: Some(message.into()),
            row_count: None,
            acquire_wait_ms,
        }
    }

    pub fn query_identifier(&self) -> &str {
        self.scenario.query_identifier()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parameter_value_from() {
        assert_eq!(ParameterValue::from(42i32), ParameterValue::Integer(42));
        assert_eq!(ParameterValue::from("A"), ParameterValue::Text("A".into()));
        assert_eq!(ParameterValue::from(true), ParameterValue::Bool(true));
    }

    #[test]
    fn test_parameter_value_from_json() {
        assert_eq!(
            ParameterValue::from_json(&json!(7)).unwrap(),
            ParameterValue::Integer(7)
        );
        assert_eq!(
            ParameterValue::from_json(&json!(1.5)).unwrap(),
            ParameterValue::Float(1.5)
        );
        assert_eq!(
            ParameterValue::from_json(&json!(null)).unwrap(),
            ParameterValue::Null
        );
        assert_eq!(
            ParameterValue::from_json(&json!("2024-03-01 12:30:00")).unwrap(),
            ParameterValue::Text("2024-03-01 12:30:00".into())
        );
        assert_eq!(
            ParameterValue::from_json(&json!("customer_001")).unwrap(),
            ParameterValue::Text("customer_001".into())
        );
        assert!(ParameterValue::from_json(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_sql_literal_escapes_quotes() {
        assert_eq!(ParameterValue::from("O'Brien").to_sql_literal(), "'O''Brien'");
        assert_eq!(ParameterValue::Null.to_sql_literal(), "NULL");
    }

    #[test]
    fn test_total_executions() {
        let def = QueryDefinition::new("q", "SELECT 1").repeat(5);
        assert_eq!(def.total_executions(), 5);

        let def = QueryDefinition::new("q", "SELECT %s")
            .parameter_set([1])
            .parameter_set([2])
            .repeat(3);
        assert_eq!(def.total_executions(), 6);
    }
}
