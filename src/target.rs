//! Resolved instance descriptors and the identifiers used to find them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Operating system family of a target; selects the remote script dialect.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    /// POSIX shell targets.
    Linux,
    /// PowerShell targets.
    Windows,
}

/// Whether the remote-management agent on a target answers.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// The agent is registered and pinging.
    Online,
    /// The agent registered once but has stopped pinging.
    ConnectionLost,
    /// The agent is registered but inactive.
    Inactive,
    /// No agent registration exists for the instance.
    Unregistered,
}

/// A concrete instance an operation acts on.
///
/// Targets are resolved fresh for every operation and are never cached.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Target {
    /// Canonical instance identifier (for example `i-0123456789abcdef0`).
    pub id: String,
    /// Display name, taken from the `Name` tag when present.
    pub name: String,
    /// Canonical region the instance lives in.
    pub region: String,
    /// Operating system family.
    pub platform: Platform,
    /// Agent reachability at resolution time.
    pub agent: AgentState,
    /// Instance tags.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl Target {
    /// Returns `true` when the agent channel can reach this target.
    #[must_use]
    pub const fn is_reachable(&self) -> bool {
        matches!(self.agent, AgentState::Online)
    }

    /// Returns `true` when every constraint in `filter` matches the tags.
    #[must_use]
    pub fn matches(&self, filter: &TagFilter) -> bool {
        filter.matches(&self.tags)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.id)
        } else {
            write!(f, "{} ({})", self.name, self.id)
        }
    }
}

/// Returns `true` when `value` is a syntactically valid instance identifier.
///
/// Accepts EC2 ids (`i-` followed by 8 or 17 lowercase hex digits) and
/// managed-instance ids (`mi-` followed by 17 hex digits).
#[must_use]
pub fn is_instance_id(value: &str) -> bool {
    let is_hex = |rest: &str| {
        rest.chars()
            .all(|ch| ch.is_ascii_digit() || ('a'..='f').contains(&ch))
    };
    if let Some(rest) = value.strip_prefix("mi-") {
        return rest.len() == 17 && is_hex(rest);
    }
    value
        .strip_prefix("i-")
        .is_some_and(|rest| matches!(rest.len(), 8 | 17) && is_hex(rest))
}

/// A single tag constraint: key present, optionally with one of `values`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TagConstraint {
    /// Tag key.
    pub key: String,
    /// Accepted values; empty means "key present with any value".
    pub values: Vec<String>,
}

/// Conjunction of tag constraints, parsed from `Key=V1,V2;Other=V`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TagFilter {
    constraints: Vec<TagConstraint>,
}

/// Raised when a tag filter expression cannot be parsed.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("invalid tag filter '{expression}': {reason}")]
pub struct TagFilterError {
    /// Expression supplied by the caller.
    pub expression: String,
    /// What was wrong with it.
    pub reason: String,
}

impl TagFilter {
    /// Parses `Key=V1,V2;Other` into a filter.
    ///
    /// # Errors
    ///
    /// Returns [`TagFilterError`] when the expression is blank or a clause
    /// has an empty key.
    pub fn parse(expression: &str) -> Result<Self, TagFilterError> {
        let invalid = |reason: &str| TagFilterError {
            expression: expression.to_owned(),
            reason: reason.to_owned(),
        };
        if expression.trim().is_empty() {
            return Err(invalid("expression is empty"));
        }

        let mut constraints = Vec::new();
        for clause in expression.split(';').map(str::trim) {
            if clause.is_empty() {
                continue;
            }
            let (key, values) = match clause.split_once('=') {
                Some((key, raw)) => (
                    key.trim(),
                    raw.split(',')
                        .map(str::trim)
                        .filter(|value| !value.is_empty())
                        .map(str::to_owned)
                        .collect(),
                ),
                None => (clause, Vec::new()),
            };
            if key.is_empty() {
                return Err(invalid("tag key is empty"));
            }
            constraints.push(TagConstraint {
                key: key.to_owned(),
                values,
            });
        }

        if constraints.is_empty() {
            return Err(invalid("expression has no clauses"));
        }
        Ok(Self { constraints })
    }

    /// Returns the parsed constraints.
    #[must_use]
    pub fn constraints(&self) -> &[TagConstraint] {
        &self.constraints
    }

    /// Returns `true` when every constraint is satisfied by `tags`.
    #[must_use]
    pub fn matches(&self, tags: &BTreeMap<String, String>) -> bool {
        self.constraints.iter().all(|constraint| {
            tags.get(&constraint.key).is_some_and(|value| {
                constraint.values.is_empty() || constraint.values.iter().any(|v| v == value)
            })
        })
    }
}

impl fmt::Display for TagFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self
            .constraints
            .iter()
            .map(|constraint| {
                if constraint.values.is_empty() {
                    constraint.key.clone()
                } else {
                    format!("{}={}", constraint.key, constraint.values.join(","))
                }
            })
            .collect::<Vec<_>>()
            .join(";");
        f.write_str(&rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("i-0123abcd", true)]
    #[case("i-0123456789abcdef0", true)]
    #[case("mi-0123456789abcdef0", true)]
    #[case("i-0123ABCD", false)]
    #[case("i-0123abc", false)]
    #[case("web-server", false)]
    #[case("", false)]
    fn recognises_instance_ids(#[case] value: &str, #[case] expected: bool) {
        assert_eq!(is_instance_id(value), expected);
    }

    #[rstest]
    fn tag_filter_matches_key_and_value_sets() {
        let filter = TagFilter::parse("env=prod,stage;team").expect("filter should parse");
        let mut tags = BTreeMap::new();
        tags.insert(String::from("env"), String::from("stage"));
        assert!(!filter.matches(&tags), "team tag is required");
        tags.insert(String::from("team"), String::from("ops"));
        assert!(filter.matches(&tags));
        tags.insert(String::from("env"), String::from("dev"));
        assert!(!filter.matches(&tags));
        assert_eq!(filter.to_string(), "env=prod,stage;team");
    }

    #[rstest]
    #[case("")]
    #[case("  ")]
    #[case("=prod")]
    #[case(";;")]
    fn tag_filter_rejects_malformed_expressions(#[case] expression: &str) {
        assert!(TagFilter::parse(expression).is_err());
    }
}
