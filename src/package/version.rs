//! Version attributes and version-string parsing.
//!
//! A version string such as `6.30.02-opt` is parsed into a record of named
//! attributes (`major`, `minor`, `buildConf`, ...) using per-package regular
//! expressions. The record always carries the original string under
//! `fullVersion`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Attribute key holding the unparsed version string.
pub const FULL_VERSION: &str = "fullVersion";

#[derive(Debug, Error, PartialEq)]
pub enum VersionError {
    #[error("version attribute '{attribute}' has non-numeric value '{value}'")]
    NotNumeric { attribute: String, value: String },

    #[error("unknown version attribute conversion '{0}'")]
    UnknownConversion(String),

    #[error("invalid version expression '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("failed to parse version '{version}' with any of: {}", patterns.join(", "))]
    NoMatch { version: String, patterns: Vec<String> },
}

/// One attribute value. Ordering puts nulls first, then integers, then strings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum AttrValue {
    #[default]
    Null,
    Int(i64),
    Str(String),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Null => write!(f, "null"),
            AttrValue::Int(i) => write!(f, "{}", i),
            AttrValue::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Str(s.to_string())
    }
}

impl From<i64> for AttrValue {
    fn from(i: i64) -> Self {
        AttrValue::Int(i)
    }
}

/// Named version attributes. Absent attributes read as [`AttrValue::Null`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionAttributes(BTreeMap<String, AttrValue>);

impl VersionAttributes {
    /// Attributes holding nothing but the full version string.
    pub fn new(full_version: &str) -> Self {
        let mut attrs = BTreeMap::new();
        attrs.insert(FULL_VERSION.to_string(), AttrValue::from(full_version));
        Self(attrs)
    }

    pub fn full_version(&self) -> &str {
        self.0.get(FULL_VERSION).and_then(AttrValue::as_str).unwrap_or_default()
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.0.get(name)
    }

    /// Value of `name`, null when absent.
    pub fn value(&self, name: &str) -> AttrValue {
        self.0.get(name).cloned().unwrap_or_default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<AttrValue>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttrValue)> {
        self.0.iter()
    }
}

impl FromIterator<(String, AttrValue)> for VersionAttributes {
    fn from_iter<I: IntoIterator<Item = (String, AttrValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Parses version strings of one package.
#[derive(Debug, Clone)]
pub struct VersionParser {
    patterns: Vec<Regex>,
    defaults: BTreeMap<String, AttrValue>,
}

impl VersionParser {
    pub fn new(expressions: &[String], defaults: BTreeMap<String, AttrValue>) -> Result<Self, VersionError> {
        let patterns = expressions
            .iter()
            .map(|expr| {
                Regex::new(expr).map_err(|e| VersionError::InvalidPattern {
                    pattern: expr.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns, defaults })
    }

    /// Parse `version` with the first expression matching at its start.
    ///
    /// Named groups that participated in the match override the defaults.
    /// Without any configured expression the result carries only the full
    /// version and the defaults.
    pub fn parse(&self, version: &str) -> Result<VersionAttributes, VersionError> {
        let mut attrs: BTreeMap<String, AttrValue> = self.defaults.clone();

        if !self.patterns.is_empty() {
            let caps = self.patterns.iter().find_map(|rx| {
                rx.captures(version)
                    .filter(|c| c.get(0).is_some_and(|m| m.start() == 0))
                    .map(|c| (rx, c))
            });

            let Some((rx, caps)) = caps else {
                return Err(VersionError::NoMatch {
                    version: version.to_string(),
                    patterns: self.patterns.iter().map(|r| r.as_str().to_string()).collect(),
                });
            };

            for name in rx.capture_names().flatten() {
                if let Some(m) = caps.name(name) {
                    attrs.insert(name.to_string(), AttrValue::from(m.as_str()));
                }
            }
        }

        attrs.insert(FULL_VERSION.to_string(), AttrValue::from(version));
        Ok(VersionAttributes(attrs))
    }
}
