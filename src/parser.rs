//! Parser for annotated query uploads.
//!
//! # Format
//!
//! ```text
//! -- PARAMETERS: [[1, "customer_001", 100], [2, "customer_002", 50]]
//! -- EXEC_COUNT: 5
//! -- WEIGHT: 2
//! SELECT * FROM orders WHERE id = %s AND customer = %s AND qty > %s
//! ```
//!
//! `PARAMETERS` holds a JSON array of arrays, one inner array per positional
//! parameter tuple. `EXEC_COUNT` is the repeat count (default 1). `WEIGHT` is
//! only used by the pgbench adapter. Any other `--` line is a comment; every
//! remaining non-blank line is part of the SQL template.

use std::path::Path;

use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{char, space0},
    combinator::{rest, value},
    sequence::{delimited, tuple},
    IResult,
};

use crate::error::{BenchError, BenchResult};
use crate::model::{ParameterSet, ParameterValue, QueryDefinition};
use crate::transpiler::Template;

/// Default upper bound on an upload, in bytes.
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 1024 * 1024;

/// Ingestion checks applied before an upload is parsed.
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    /// Accepted file extensions, without the dot, compared case-insensitively.
    pub allowed_extensions: Vec<String>,
    pub max_bytes: usize,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            allowed_extensions: vec!["sql".to_string()],
            max_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

impl UploadPolicy {
    /// Reject an upload by name and size, without looking at its content.
    pub fn check(&self, file_name: &str, len: usize) -> BenchResult<()> {
        let ext = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");
        if !self
            .allowed_extensions
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(ext))
        {
            return Err(BenchError::validation(
                file_name,
                format!(
                    "unsupported file extension '{}' (expected one of: {})",
                    ext,
                    self.allowed_extensions.join(", ")
                ),
            ));
        }
        if len > self.max_bytes {
            return Err(BenchError::validation(
                file_name,
                format!("upload is {} bytes, limit is {}", len, self.max_bytes),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Key {
    Parameters,
    ExecCount,
    Weight,
}

/// Parse `-- KEY: value` into its key and raw value.
fn parse_annotation(input: &str) -> IResult<&str, (Key, &str)> {
    let (input, _) = tuple((tag("--"), space0))(input)?;
    let (input, key) = alt((
        value(Key::Parameters, tag("PARAMETERS")),
        value(Key::ExecCount, tag("EXEC_COUNT")),
        value(Key::Weight, tag("WEIGHT")),
    ))(input)?;
    let (input, _) = delimited(space0, char(':'), space0)(input)?;
    let (input, raw) = rest(input)?;
    Ok((input, (key, raw.trim())))
}

/// Parse an upload after running the ingestion checks.
pub fn parse_upload(
    file_name: &str,
    content: &[u8],
    policy: &UploadPolicy,
) -> BenchResult<QueryDefinition> {
    policy.check(file_name, content.len())?;
    let text = std::str::from_utf8(content)
        .map_err(|e| BenchError::validation(file_name, format!("not valid UTF-8: {}", e)))?;
    let identifier = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name);
    parse_annotated(identifier, text)
}

/// Parse annotated SQL text into a validated definition.
pub fn parse_annotated(identifier: &str, text: &str) -> BenchResult<QueryDefinition> {
    let mut sql_lines = Vec::new();
    let mut parameter_sets: Option<Vec<ParameterSet>> = None;
    let mut repeat_count: Option<u32> = None;
    let mut weight: Option<u32> = None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !line.starts_with("--") {
            sql_lines.push(line);
            continue;
        }
        let Ok((_, (key, raw))) = parse_annotation(line) else {
            continue;
        };
        match key {
            Key::Parameters => {
                if parameter_sets.is_some() {
                    return Err(BenchError::validation(identifier, "duplicate PARAMETERS line"));
                }
                parameter_sets = Some(parse_parameter_sets(identifier, raw)?);
            }
            Key::ExecCount => {
                if repeat_count.is_some() {
                    return Err(BenchError::validation(identifier, "duplicate EXEC_COUNT line"));
                }
                repeat_count = Some(parse_positive(identifier, "EXEC_COUNT", raw)?);
            }
            Key::Weight => {
                if weight.is_some() {
                    return Err(BenchError::validation(identifier, "duplicate WEIGHT line"));
                }
                weight = Some(parse_positive(identifier, "WEIGHT", raw)?);
            }
        }
    }

    let definition = QueryDefinition {
        identifier: identifier.to_string(),
        sql_template: sql_lines.join("\n"),
        parameter_sets: parameter_sets.unwrap_or_default(),
        repeat_count: repeat_count.unwrap_or(1),
        weight,
    };
    validate_definition(&definition)?;
    Ok(definition)
}

fn parse_parameter_sets(identifier: &str, raw: &str) -> BenchResult<Vec<ParameterSet>> {
    let json: serde_json::Value = serde_json::from_str(raw).map_err(|e| {
        BenchError::validation(identifier, format!("invalid JSON in PARAMETERS: {}", e))
    })?;
    let serde_json::Value::Array(rows) = json else {
        return Err(BenchError::validation(
            identifier,
            "PARAMETERS must be a JSON array of arrays",
        ));
    };

    rows.iter()
        .enumerate()
        .map(|(i, row)| {
            let serde_json::Value::Array(values) = row else {
                return Err(BenchError::validation(
                    identifier,
                    format!("parameter set {} is not an array", i + 1),
                ));
            };
            values
                .iter()
                .map(|v| {
                    ParameterValue::from_json(v).map_err(|e| {
                        BenchError::validation(identifier, format!("parameter set {}: {}", i + 1, e))
                    })
                })
                .collect()
        })
        .collect()
}

fn parse_positive(identifier: &str, key: &str, raw: &str) -> BenchResult<u32> {
    match raw.parse::<u32>() {
        Ok(n) if n >= 1 => Ok(n),
        Ok(_) => Err(BenchError::validation(
            identifier,
            format!("{} must be at least 1", key),
        )),
        Err(_) => Err(BenchError::validation(
            identifier,
            format!("{} is not an integer: '{}'", key, raw),
        )),
    }
}

/// Structural checks shared by uploads and predefined definitions.
pub fn validate_definition(def: &QueryDefinition) -> BenchResult<()> {
    let id = def.identifier.as_str();
    if id.trim().is_empty() {
        return Err(BenchError::validation("<unnamed>", "query identifier is empty"));
    }
    if def.sql_template.trim().is_empty() {
        return Err(BenchError::validation(id, "query is empty"));
    }
    if def.repeat_count == 0 {
        return Err(BenchError::validation(id, "repeat count must be at least 1"));
    }
    if let Some(w) = def.weight
        && !(1..=100).contains(&w)
    {
        return Err(BenchError::validation(id, "weight must be between 1 and 100"));
    }

    let template = Template::parse(&def.sql_template);
    if template.has_stray_percent() {
        return Err(BenchError::validation(
            id,
            "found % but no %s placeholder; use %% for a literal percent",
        ));
    }

    let expected = template.placeholder_count();
    if expected > 0 && def.parameter_sets.is_empty() {
        return Err(BenchError::validation(
            id,
            format!("query has {} placeholder(s) but no PARAMETERS", expected),
        ));
    }
    for (i, set) in def.parameter_sets.iter().enumerate() {
        if set.len() != expected {
            return Err(BenchError::validation(
                id,
                format!(
                    "parameter set {} has {} value(s), expected {}",
                    i + 1,
                    set.len(),
                    expected
                ),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const ORDERS: &str = r#"
-- Orders by customer
-- PARAMETERS: [[1, "customer_001", 100], [2, "customer_002", 50]]
-- EXEC_COUNT: 5
SELECT * FROM orders
WHERE id = %s AND customer = %s AND qty > %s
"#;

    #[test]
    fn test_parse_annotated() {
        let def = parse_annotated("orders", ORDERS).unwrap();
        assert_eq!(def.identifier, "orders");
        assert_eq!(
            def.sql_template,
            "SELECT * FROM orders\nWHERE id = %s AND customer = %s AND qty > %s"
        );
        assert_eq!(def.parameter_sets.len(), 2);
        assert_eq!(
            def.parameter_sets[0],
            vec![
                ParameterValue::Integer(1),
                ParameterValue::Text("customer_001".into()),
                ParameterValue::Integer(100),
            ]
        );
        assert_eq!(def.repeat_count, 5);
        assert_eq!(def.weight, None);
    }

    #[test]
    fn test_repeat_defaults_to_one() {
        let def = parse_annotated("q", "SELECT 1").unwrap();
        assert_eq!(def.repeat_count, 1);
        assert!(def.parameter_sets.is_empty());
    }

    #[test]
    fn test_reparse_is_identical() {
        let a = parse_annotated("orders", ORDERS).unwrap();
        let b = parse_annotated("orders", ORDERS).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_malformed_json() {
        let err = parse_annotated("bad", "-- PARAMETERS: [[1, 2\nSELECT %s, %s").unwrap_err();
        assert!(err.to_string().contains("invalid JSON"), "{err}");
    }

    #[test]
    fn test_non_integer_exec_count() {
        let err = parse_annotated("bad", "-- EXEC_COUNT: five\nSELECT 1").unwrap_err();
        assert!(matches!(err, BenchError::Validation { .. }));
        let err = parse_annotated("bad", "-- EXEC_COUNT: 0\nSELECT 1").unwrap_err();
        assert!(err.to_string().contains("at least 1"));
    }

    #[test]
    fn test_arity_mismatch() {
        let err = parse_annotated("bad", "-- PARAMETERS: [[1]]\nSELECT %s, %s").unwrap_err();
        assert!(err.to_string().contains("expected 2"), "{err}");
    }

    #[test]
    fn test_placeholders_without_parameters() {
        let err = parse_annotated("bad", "SELECT * FROM t WHERE id = %s").unwrap_err();
        assert!(err.to_string().contains("no PARAMETERS"));
    }

    #[test]
    fn test_weight_annotation() {
        let def = parse_annotated("w", "-- WEIGHT: 3\nSELECT 1").unwrap();
        assert_eq!(def.weight, Some(3));
    }

    #[test]
    fn test_upload_policy() {
        let policy = UploadPolicy {
            allowed_extensions: vec!["sql".into()],
            max_bytes: 16,
        };
        assert!(parse_upload("q.txt", b"SELECT 1", &policy).is_err());
        assert!(parse_upload("q.sql", b"SELECT * FROM big_table", &policy).is_err());
        let def = parse_upload("Q1.SQL", b"SELECT 1", &policy).unwrap();
        assert_eq!(def.identifier, "Q1");
        assert_eq!(def.sql_template, "SELECT 1");
    }

    #[test]
    fn test_identifier_from_file_stem() {
        let def = parse_upload("top_customers.sql", b"SELECT 1", &UploadPolicy::default()).unwrap();
        assert_eq!(def.identifier, "top_customers");
    }
}
