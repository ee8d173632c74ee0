//! Placeholder transpiler for query templates.
//!
//! Templates use `%s` positional placeholders. Before submission they are
//! rewritten to the driver's bound-parameter syntax (`$1`, `$2`, ...), or to
//! `:p1`, `:p2`, ... variables for pgbench scripts. This is a text transform
//! only; no SQL dialect translation happens here.
//!
//! `%%` is an escaped literal percent sign.
//!
//! Text and NULL values are never bound: the driver sends bound values in
//! binary form with a fixed type, which the server will not coerce to a
//! date, uuid or integer column. They are inlined as quoted literals of
//! unknown type instead, and the server resolves them from context.

use nom::{
    branch::alt,
    bytes::complete::{is_not, tag},
    combinator::{map, value},
    multi::many0,
    IResult,
};

use crate::model::ParameterValue;

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Placeholder,
    Percent,
    /// A `%` not followed by `s` or `%`.
    Stray,
}

/// A tokenized query template.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    /// Tokenize a template. Never fails: every input has a tokenization.
    pub fn parse(input: &str) -> Self {
        match parse_segments(input) {
            Ok((rest, mut segments)) => {
                if !rest.is_empty() {
                    segments.push(Segment::Text(rest.to_string()));
                }
                Self { segments }
            }
            Err(_) => Self {
                segments: vec![Segment::Text(input.to_string())],
            },
        }
    }

    /// Number of `%s` placeholders.
    pub fn placeholder_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| **s == Segment::Placeholder)
            .count()
    }

    /// True if the template has a `%` that is neither `%s` nor `%%`.
    pub fn has_stray_percent(&self) -> bool {
        self.segments.iter().any(|s| *s == Segment::Stray)
    }

    /// Render for a pgbench script. Each placeholder is replaced verbatim by
    /// the matching entry of `args`, either a `:name` variable or an inline
    /// literal.
    ///
    /// Placeholders beyond `args.len()` are left as `%s`.
    pub fn to_pgbench(&self, args: &[String]) -> String {
        let mut next = 0;
        self.render(|out| {
            match args.get(next) {
                Some(arg) => out.push_str(arg),
                None => out.push_str("%s"),
            }
            next += 1;
        })
    }

    /// Render for binding against `params`.
    ///
    /// Text and NULL values are inlined as untyped literals; every other
    /// value becomes a `$n` placeholder, numbered in order. Returns the SQL
    /// and the values left to bind. A placeholder with no value renders as
    /// `NULL`.
    pub fn to_bound<'a>(&self, params: &'a [ParameterValue]) -> (String, Vec<&'a ParameterValue>) {
        let mut bound = Vec::new();
        let mut next = 0;
        let sql = self.render(|out| {
            match params.get(next) {
                Some(value @ (ParameterValue::Text(_) | ParameterValue::Null)) => {
                    out.push_str(&value.to_sql_literal())
                }
                Some(value) => {
                    bound.push(value);
                    out.push('$');
                    out.push_str(&bound.len().to_string());
                }
                None => out.push_str("NULL"),
            }
            next += 1;
        });
        (sql, bound)
    }

    fn render(&self, mut placeholder: impl FnMut(&mut String)) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(t) => out.push_str(t),
                Segment::Placeholder => placeholder(&mut out),
                Segment::Percent | Segment::Stray => out.push('%'),
            }
        }
        out
    }
}

fn parse_segments(input: &str) -> IResult<&str, Vec<Segment>> {
    many0(alt((
        value(Segment::Placeholder, tag("%s")),
        value(Segment::Percent, tag("%%")),
        value(Segment::Stray, tag("%")),
        map(is_not("%"), |s: &str| Segment::Text(s.to_string())),
    )))(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positional_rewrite() {
        let t = Template::parse("SELECT * FROM orders WHERE id = %s AND qty = %s");
        let params = vec![ParameterValue::Integer(1), ParameterValue::Integer(100)];
        assert_eq!(
            t.to_bound(&params).0,
            "SELECT * FROM orders WHERE id = $1 AND qty = $2"
        );
    }

    #[test]
    fn test_no_placeholders() {
        let t = Template::parse("SELECT 1");
        assert_eq!(t.to_bound(&[]).0, "SELECT 1");
        assert_eq!(t.placeholder_count(), 0);
    }

    #[test]
    fn test_escaped_percent() {
        let t = Template::parse("SELECT * FROM t WHERE name LIKE 'a%%' AND id = %s");
        assert_eq!(t.placeholder_count(), 1);
        assert!(!t.has_stray_percent());
        assert_eq!(
            t.to_bound(&[ParameterValue::Integer(3)]).0,
            "SELECT * FROM t WHERE name LIKE 'a%' AND id = $1"
        );
    }

    #[test]
    fn test_stray_percent() {
        let t = Template::parse("SELECT * FROM t WHERE name LIKE 'a%'");
        assert!(t.has_stray_percent());
        assert_eq!(t.placeholder_count(), 0);
        assert_eq!(t.to_bound(&[]).0, "SELECT * FROM t WHERE name LIKE 'a%'");
    }

    #[test]
    fn test_pgbench_variables() {
        let t = Template::parse("SELECT * FROM t WHERE a = %s AND b = %s");
        let args = vec![":p1".to_string(), "'x'".to_string()];
        assert_eq!(t.to_pgbench(&args), "SELECT * FROM t WHERE a = :p1 AND b = 'x'");
        assert_eq!(t.to_pgbench(&args[..1]), "SELECT * FROM t WHERE a = :p1 AND b = %s");
    }

    #[test]
    fn test_bound_inlines_text_and_null() {
        let t = Template::parse("SELECT * FROM t WHERE id = %s AND d = %s AND u = %s AND n = %s");
        let params = vec![
            ParameterValue::Null,
            ParameterValue::from("2024-01-05"),
            ParameterValue::Integer(7),
            ParameterValue::from("O'Brien"),
        ];
        let (sql, bound) = t.to_bound(&params);
        assert_eq!(
            sql,
            "SELECT * FROM t WHERE id = NULL AND d = '2024-01-05' AND u = $1 AND n = 'O''Brien'"
        );
        assert_eq!(bound, vec![&ParameterValue::Integer(7)]);
    }

    #[test]
    fn test_bound_numbers_typed_values_in_order() {
        let t = Template::parse("SELECT %s, %s, %s");
        let params = vec![
            ParameterValue::Integer(1),
            ParameterValue::from("x"),
            ParameterValue::Float(2.5),
        ];
        let (sql, bound) = t.to_bound(&params);
        assert_eq!(sql, "SELECT $1, 'x', $2");
        assert_eq!(bound.len(), 2);
        assert_eq!(t.to_bound(&[]).0, "SELECT NULL, NULL, NULL");
    }

    #[test]
    fn test_placeholder_at_edges() {
        let one = [ParameterValue::Integer(1)];
        let two = [ParameterValue::Integer(1), ParameterValue::Bool(true)];
        assert_eq!(Template::parse("%s").to_bound(&one).0, "$1");
        assert_eq!(Template::parse("%s,%s").to_bound(&two).0, "$1,$2");
    }
}
