use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identity of one installed package version.
///
/// Serialized as a `[name, version]` pair, which is how manifests record
/// their dependencies and how the graph cache stores its nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "(String, String)", into = "(String, String)")]
pub struct PackageKey {
    pub name: String,
    pub version: String,
}

impl PackageKey {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for PackageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

impl FromStr for PackageKey {
    type Err = anyhow::Error;

    /// Parses `name/version`. Only the first slash separates the two parts.
    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((name, version)) if !name.is_empty() && !version.is_empty() => Ok(Self::new(name, version)),
            _ => Err(anyhow!(
                "Invalid package reference '{}'. Expected format: name/version",
                s
            )),
        }
    }
}

impl From<(String, String)> for PackageKey {
    fn from((name, version): (String, String)) -> Self {
        Self { name, version }
    }
}

impl From<PackageKey> for (String, String) {
    fn from(key: PackageKey) -> Self {
        (key.name, key.version)
    }
}
