// ============================================================================
// Row evaluation: raw WHERE conditions, LIKE patterns, ordering
// ============================================================================

use crate::core::{DbError, Fields, Result, Value};
use crate::parser::{CompareOp, Condition};
use regex::{Regex, RegexBuilder};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Evaluates bound conditions against rows with SQL three-valued logic.
///
/// `None` stands for UNKNOWN; only rows evaluating to `Some(true)` qualify.
/// Compiled LIKE patterns are cached for the lifetime of the evaluator, which
/// is one statement.
#[derive(Default)]
pub struct ConditionEvaluator {
    patterns: HashMap<(String, bool), Regex>,
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn matches(&mut self, condition: &Condition, row: &Fields) -> Result<bool> {
        Ok(self.evaluate(condition, row)? == Some(true))
    }

    fn evaluate(&mut self, condition: &Condition, row: &Fields) -> Result<Option<bool>> {
        match condition {
            Condition::And(left, right) => {
                let l = self.evaluate(left, row)?;
                if l == Some(false) {
                    return Ok(Some(false));
                }
                let r = self.evaluate(right, row)?;
                Ok(match (l, r) {
                    (_, Some(false)) => Some(false),
                    (Some(true), Some(true)) => Some(true),
                    _ => None,
                })
            }
            Condition::Or(left, right) => {
                let l = self.evaluate(left, row)?;
                if l == Some(true) {
                    return Ok(Some(true));
                }
                let r = self.evaluate(right, row)?;
                Ok(match (l, r) {
                    (_, Some(true)) => Some(true),
                    (Some(false), Some(false)) => Some(false),
                    _ => None,
                })
            }
            Condition::Not(inner) => Ok(self.evaluate(inner, row)?.map(|b| !b)),
            Condition::Compare { column, op, value } => {
                let actual = column_value(row, column)?;
                if actual.is_null() || value.is_null() {
                    return Ok(None);
                }
                let ordering = actual.compare(value)?;
                Ok(Some(match op {
                    CompareOp::Eq => ordering == Ordering::Equal,
                    CompareOp::NotEq => ordering != Ordering::Equal,
                    CompareOp::Lt => ordering == Ordering::Less,
                    CompareOp::LtEq => ordering != Ordering::Greater,
                    CompareOp::Gt => ordering == Ordering::Greater,
                    CompareOp::GtEq => ordering != Ordering::Less,
                }))
            }
            Condition::In {
                column,
                values,
                negated,
            } => {
                let actual = column_value(row, column)?;
                if actual.is_null() {
                    return Ok(None);
                }
                let found = values.iter().any(|v| actual.sql_eq(v));
                if !found && values.iter().any(Value::is_null) {
                    return Ok(None);
                }
                Ok(Some(found != *negated))
            }
            Condition::Like {
                column,
                pattern,
                negated,
                case_insensitive,
            } => {
                let actual = column_value(row, column)?;
                let text = match actual {
                    Value::Null => return Ok(None),
                    Value::Text(text) => text,
                    other => {
                        return Err(DbError::Validation(format!(
                            "LIKE requires a text column, '{}' is {}",
                            column,
                            other.type_name()
                        )));
                    }
                };
                let matched = self.like(text, pattern, !*case_insensitive)?;
                Ok(Some(matched != *negated))
            }
            Condition::IsNull { column, negated } => {
                let actual = column_value(row, column)?;
                Ok(Some(actual.is_null() != *negated))
            }
        }
    }

    fn like(&mut self, text: &str, pattern: &str, case_sensitive: bool) -> Result<bool> {
        if let Some(result) = fast_path_like(text, pattern, case_sensitive) {
            return Ok(result);
        }

        let key = (pattern.to_string(), case_sensitive);
        if !self.patterns.contains_key(&key) {
            let compiled = RegexBuilder::new(&like_to_regex(pattern))
                .case_insensitive(!case_sensitive)
                .build()
                .map_err(|e| DbError::Validation(format!("Invalid LIKE pattern: {}", e)))?;
            self.patterns.insert(key.clone(), compiled);
        }

        Ok(self
            .patterns
            .get(&key)
            .is_some_and(|regex| regex.is_match(text)))
    }
}

fn column_value<'a>(row: &'a Fields, column: &str) -> Result<&'a Value> {
    row.get(column)
        .ok_or_else(|| DbError::from_sqlstate("42703", format!("column '{}' does not exist", column)))
}

/// Translates a LIKE pattern (`%`, `_`, `\` escape) into an anchored regex.
fn like_to_regex(pattern: &str) -> String {
    let mut regex = String::with_capacity(pattern.len() + 2);
    regex.push('^');

    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '%' => regex.push_str(".*"),
            '_' => regex.push('.'),
            '\\' => match chars.next() {
                Some(escaped) => regex.push_str(&regex::escape(&escaped.to_string())),
                None => regex.push_str(r"\\"),
            },
            c => regex.push_str(&regex::escape(&c.to_string())),
        }
    }

    regex.push('$');
    regex
}

/// Prefix / suffix / substring / exact patterns without escapes skip regex entirely.
fn fast_path_like(text: &str, pattern: &str, case_sensitive: bool) -> Option<bool> {
    if pattern.contains('_') || pattern.contains('\\') {
        return None;
    }

    let (text, pattern) = if case_sensitive {
        (text.to_string(), pattern.to_string())
    } else {
        (text.to_lowercase(), pattern.to_lowercase())
    };

    let wildcards = pattern.matches('%').count();
    match wildcards {
        0 => Some(text == pattern),
        1 if pattern.ends_with('%') => Some(text.starts_with(&pattern[..pattern.len() - 1])),
        1 if pattern.starts_with('%') => Some(text.ends_with(&pattern[1..])),
        2 if pattern.len() >= 2 && pattern.starts_with('%') && pattern.ends_with('%') => {
            Some(text.contains(&pattern[1..pattern.len() - 1]))
        }
        _ => None,
    }
}

/// Ordering used for ORDER BY: SQL comparison, NULLs last, with a structural
/// fallback for values of unrelated kinds.
pub fn sort_cmp(a: &Value, b: &Value) -> Ordering {
    a.compare(b).unwrap_or_else(|_| a.cmp(b))
}

/// Sorts rows by `(column, descending)` keys, breaking ties on `primary_key` ascending.
pub fn sort_rows(rows: &mut [Fields], keys: &[(String, bool)], primary_key: &str) {
    rows.sort_by(|a, b| {
        for (column, descending) in keys {
            let ordering = match (a.get(column), b.get(column)) {
                (Some(x), Some(y)) => sort_cmp(x, y),
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (None, None) => Ordering::Equal,
            };
            let ordering = if *descending {
                ordering.reverse()
            } else {
                ordering
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        match (a.get(primary_key), b.get(primary_key)) {
            (Some(x), Some(y)) => sort_cmp(x, y),
            _ => Ordering::Equal,
        }
    });
}
