//! Filter expressions in the backend's query syntax.
//!
//! Only the subset the store needs is produced and understood here:
//! equality clauses joined by `&&`.

use serde_json::Value;

/// A value that can appear on the right of `=`.
pub trait FilterLiteral {
    fn literal(&self) -> String;
}

impl FilterLiteral for &str {
    fn literal(&self) -> String {
        format!("\"{}\"", self.replace('\\', "\\\\").replace('"', "\\\""))
    }
}

impl FilterLiteral for String {
    fn literal(&self) -> String {
        self.as_str().literal()
    }
}

impl FilterLiteral for &String {
    fn literal(&self) -> String {
        self.as_str().literal()
    }
}

impl FilterLiteral for bool {
    fn literal(&self) -> String {
        self.to_string()
    }
}

impl FilterLiteral for u32 {
    fn literal(&self) -> String {
        self.to_string()
    }
}

pub fn eq(field: &str, value: impl FilterLiteral) -> String {
    format!("{} = {}", field, value.literal())
}

pub fn and<I, S>(clauses: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    clauses
        .into_iter()
        .map(|clause| clause.as_ref().to_string())
        .collect::<Vec<_>>()
        .join(" && ")
}

#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub field: String,
    pub value: Value,
}

impl Clause {
    /// Evaluate against a record. Numbers compare numerically; a missing
    /// field only matches `null` or `""`.
    pub fn matches(&self, record: &Value) -> bool {
        let actual = record.get(&self.field).unwrap_or(&Value::Null);
        match (actual, &self.value) {
            (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
            (Value::Null, Value::String(s)) | (Value::String(s), Value::Null) => s.is_empty(),
            (a, b) => a == b,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
#[error("invalid filter near `{near}`: {reason}")]
pub struct FilterError {
    pub near: String,
    pub reason: &'static str,
}

fn error(near: &str, reason: &'static str) -> FilterError {
    FilterError { near: near.chars().take(24).collect(), reason }
}

/// Parse `a = "x" && b = true` style expressions.
pub fn parse(filter: &str) -> Result<Vec<Clause>, FilterError> {
    let mut clauses = Vec::new();
    let mut rest = filter.trim();

    while !rest.is_empty() {
        let (field, after) = rest.split_once('=').ok_or_else(|| error(rest, "expected `=`"))?;
        let field = field.trim();
        if field.is_empty() || !field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.') {
            return Err(error(rest, "unsupported field or operator"));
        }

        let after = after.trim_start();
        let (value, remainder) = match after.chars().next() {
            Some(quote @ ('"' | '\'')) => quoted(&after[1..], quote).ok_or_else(|| error(after, "unterminated string"))?,
            Some(_) => bare(after)?,
            None => return Err(error(rest, "missing value")),
        };
        clauses.push(Clause { field: field.to_string(), value });

        rest = remainder.trim_start();
        if rest.is_empty() {
            break;
        }
        rest = rest
            .strip_prefix("&&")
            .ok_or_else(|| error(rest, "expected `&&`"))?
            .trim_start();
        if rest.is_empty() {
            return Err(error(filter, "dangling `&&`"));
        }
    }

    Ok(clauses)
}

fn quoted(input: &str, quote: char) -> Option<(Value, &str)> {
    let mut value = String::new();
    let mut escaped = false;
    for (index, c) in input.char_indices() {
        if escaped {
            value.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == quote {
            return Some((Value::String(value), &input[index + c.len_utf8()..]));
        } else {
            value.push(c);
        }
    }
    None
}

fn bare(input: &str) -> Result<(Value, &str), FilterError> {
    let end = input
        .find(|c: char| c.is_whitespace() || c == '&')
        .unwrap_or(input.len());
    let (token, remainder) = input.split_at(end);
    let value = match token {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" => Value::Null,
        number => serde_json::from_str::<serde_json::Number>(number)
            .map(Value::Number)
            .map_err(|_| error(input, "unquoted value"))?,
    };
    Ok((value, remainder))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builds_quoted_conjunctions() {
        let filter = and([eq("ot_day", "d1"), eq("removed", false), eq("order", 3u32)]);
        assert_eq!(filter, r#"ot_day = "d1" && removed = false && order = 3"#);
        assert_eq!(eq("name", r#"say "hi""#), r#"name = "say \"hi\"""#);
    }

    #[test]
    fn parses_what_it_builds() {
        let filter = and([eq("ot_day", "a && b"), eq("removed", false), eq("order", 3u32)]);
        let clauses = parse(&filter).unwrap();
        assert_eq!(
            clauses,
            vec![
                Clause { field: "ot_day".into(), value: json!("a && b") },
                Clause { field: "removed".into(), value: json!(false) },
                Clause { field: "order".into(), value: json!(3) },
            ]
        );
    }

    #[test]
    fn matches_records() {
        let clauses = parse(r#"ot_day = 'd1' && order = 2"#).unwrap();
        let record = json!({"ot_day": "d1", "order": 2.0});
        assert!(clauses.iter().all(|c| c.matches(&record)));
        let record = json!({"ot_day": "d2", "order": 2});
        assert!(!clauses.iter().all(|c| c.matches(&record)));
    }

    #[test]
    fn rejects_unsupported_syntax() {
        assert!(parse("order > 2").is_err());
        assert!(parse(r#"a = "open"#).is_err());
        assert!(parse("a = 1 &&").is_err());
        assert!(parse("a = 1 || b = 2").is_err());
        assert!(parse("a = bareword").is_err());
        assert_eq!(parse("   ").unwrap(), Vec::new());
    }
}
