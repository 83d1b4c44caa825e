//!
//! Variable and label algebra
//! --------------------------
//! A variable is a path-like name plus an ordered list of `label=value`
//! pairs, written `name{k=v,k2="quoted,value"}`. This module owns parsing,
//! deterministic formatting, label accessors, equality (name + label map,
//! order-insensitive) and the match semantics used by queries and retention
//! rules: trailing-`*` name wildcards, `k=*` presence checks, `k=/re/` full
//! regex matches and plain string equality.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

use crate::error::{Result, StoreError};

/// Declared semantics of a variable's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ValueType {
    #[default]
    Unknown,
    Gauge,
    Rate,
    Counter,
}

/// Named time-series identifier with ordered labels.
///
/// Labels keep insertion order so formatting is deterministic; equality
/// compares the label *map* and is order-insensitive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Variable {
    name: String,
    labels: Vec<(String, String)>,
    #[serde(default)]
    value_type: ValueType,
}

/// Characters a label value may contain without requiring quotes.
fn is_safe_value_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ' ' | '*' | '/')
}

impl Variable {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Variable {
            name: name.into(),
            labels: Vec::new(),
            value_type: ValueType::Unknown,
        }
    }

    /// Parse the textual form `name{k=v,...}`.
    ///
    /// A missing `{` means an empty label set. A label entry without `=`, an
    /// unterminated brace or quote, an empty name, or a name containing
    /// whitespace or control characters is a hard parse failure.
    pub fn parse(input: &str) -> Result<Self> {
        let (name, labelstring) = match input.find('{') {
            Some(pos) => {
                let rest = &input[pos + 1..];
                let close = rest
                    .rfind('}')
                    .ok_or_else(|| StoreError::invalid_variable(format!("unterminated labels in \"{input}\"")))?;
                (&input[..pos], Some(&rest[..close]))
            }
            None => (input, None),
        };
        Self::validate_name(name)?;
        let mut var = Variable::new(name);
        if let Some(labels) = labelstring {
            for token in split_label_list(labels)? {
                let eq = token.find('=').ok_or_else(|| {
                    StoreError::invalid_variable(format!("label \"{token}\" does not contain '='"))
                })?;
                let label = token[..eq].trim();
                if label.is_empty() {
                    return Err(StoreError::invalid_variable(format!("empty label name in \"{input}\"")));
                }
                let value = unquote_value(token[eq + 1..].trim())?;
                var.set_label(label, &value);
            }
        }
        Ok(var)
    }

    fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(StoreError::invalid_variable("empty variable name"));
        }
        if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(StoreError::invalid_variable(format!(
                "variable name \"{name}\" contains whitespace or control characters"
            )));
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub fn set_value_type(&mut self, value_type: ValueType) {
        self.value_type = value_type;
    }

    /// Set a label, replacing any existing value in place.
    pub fn set_label(&mut self, label: &str, value: &str) {
        for pair in self.labels.iter_mut() {
            if pair.0 == label {
                pair.1 = value.to_string();
                return;
            }
        }
        self.labels.push((label.to_string(), value.to_string()));
    }

    pub fn get_label(&self, label: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| k == label)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|(k, _)| k == label)
    }

    pub fn remove_label(&mut self, label: &str) {
        self.labels.retain(|(k, _)| k != label);
    }

    pub fn label_names(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(|(k, _)| k.as_str())
    }

    pub fn labels(&self) -> impl Iterator<Item = (&str, &str)> {
        self.labels.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Match against a search pattern (§3 semantics).
    ///
    /// The search name may end in `*` to match any suffix. Each search label
    /// must be satisfied: `*` means the key is present, `/re/` is a full
    /// regex match of the value, anything else is string equality. Labels on
    /// `self` that the search does not mention are ignored.
    pub fn matches(&self, search: &Variable) -> bool {
        if let Some(prefix) = search.name.strip_suffix('*') {
            if !self.name.starts_with(prefix) {
                return false;
            }
        } else if self.name != search.name {
            return false;
        }
        for (label, pattern) in search.labels() {
            if pattern == "*" {
                if !self.has_label(label) {
                    return false;
                }
            } else if pattern.len() > 2 && pattern.starts_with('/') && pattern.ends_with('/') {
                let value = self.get_label(label).unwrap_or("");
                let re = &pattern[1..pattern.len() - 1];
                match regex::Regex::new(&format!("^(?:{re})$")) {
                    Ok(re) => {
                        if !re.is_match(value) {
                            return false;
                        }
                    }
                    Err(e) => {
                        warn!(target: "tidemark::variable", "bad label regex {pattern}: {e}");
                        return false;
                    }
                }
            } else if self.get_label(label).unwrap_or("") != pattern {
                return false;
            }
        }
        true
    }
}

/// Equality is name plus label-map identity; insertion order and value type
/// do not participate.
impl PartialEq for Variable {
    fn eq(&self, other: &Self) -> bool {
        if self.name != other.name || self.labels.len() != other.labels.len() {
            return false;
        }
        self.labels
            .iter()
            .all(|(k, v)| other.get_label(k) == Some(v.as_str()))
    }
}

impl Eq for Variable {}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if self.labels.iter().any(|(_, v)| !v.is_empty()) {
            f.write_str("{")?;
            let mut first = true;
            for (label, value) in self.labels() {
                if value.is_empty() {
                    continue;
                }
                if !first {
                    f.write_str(",")?;
                }
                first = false;
                write!(f, "{label}=")?;
                if value.chars().all(is_safe_value_char) {
                    f.write_str(value)?;
                } else {
                    f.write_str("\"")?;
                    for c in value.chars() {
                        if c == '"' || c == '\\' || c == ',' {
                            f.write_str("\\")?;
                        }
                        write!(f, "{c}")?;
                    }
                    f.write_str("\"")?;
                }
            }
            f.write_str("}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Variable {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        Variable::parse(s)
    }
}

/// Split a label list on commas, honoring double quotes and backslash
/// escapes so quoted values may contain commas.
fn split_label_list(input: &str) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                current.push(c);
                match chars.next() {
                    Some(next) => current.push(next),
                    None => {
                        return Err(StoreError::invalid_variable(format!(
                            "dangling escape in label list \"{input}\""
                        )))
                    }
                }
            }
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => {
                out.push(std::mem::take(&mut current));
                continue;
            }
            _ => current.push(c),
        }
    }
    if in_quotes {
        return Err(StoreError::invalid_variable(format!(
            "unterminated quote in label list \"{input}\""
        )));
    }
    if !current.is_empty() {
        out.push(current);
    }
    Ok(out.into_iter().filter(|t| !t.trim().is_empty()).collect())
}

/// Strip surrounding double quotes and resolve backslash escapes.
fn unquote_value(input: &str) -> Result<String> {
    let inner = if input.len() >= 2 && input.starts_with('"') && input.ends_with('"') {
        &input[1..input.len() - 1]
    } else {
        input
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next) => out.push(next),
                None => {
                    return Err(StoreError::invalid_variable(format!(
                        "dangling escape in label value \"{input}\""
                    )))
                }
            }
        } else {
            out.push(c);
        }
    }
    Ok(out)
}
