use crate::core::{DbError, Fields, Result};
use regex::RegexSet;
use std::collections::BTreeMap;

pub const REDACTED: &str = "[REDACTED]";

/// Masks sensitive attribute values before they are logged.
///
/// An attribute is sensitive when its name contains one of the configured
/// field names, ignoring case, so `password` also covers `password_hash`.
#[derive(Debug, Clone)]
pub struct Redactor {
    patterns: RegexSet,
}

impl Redactor {
    pub fn new<I, S>(sensitive_fields: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns: Vec<String> = sensitive_fields
            .into_iter()
            .map(|field| field.as_ref().trim().to_string())
            .filter(|field| !field.is_empty())
            .map(|field| format!("(?i){}", regex::escape(&field)))
            .collect();

        let patterns = RegexSet::new(&patterns).map_err(|e| {
            DbError::Configuration(format!("Invalid sensitive field list: {}", e))
        })?;
        Ok(Self { patterns })
    }

    pub fn is_sensitive(&self, field: &str) -> bool {
        self.patterns.is_match(field)
    }

    /// Attribute map with sensitive values replaced by `[REDACTED]`.
    pub fn sanitize(&self, attributes: &Fields) -> BTreeMap<String, String> {
        attributes
            .iter()
            .map(|(field, value)| {
                let shown = if self.is_sensitive(field) {
                    REDACTED.to_string()
                } else {
                    value.to_string()
                };
                (field.clone(), shown)
            })
            .collect()
    }
}

impl Default for Redactor {
    fn default() -> Self {
        Self {
            patterns: RegexSet::empty(),
        }
    }
}
