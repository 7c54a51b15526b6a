use glob::Pattern;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::str::FromStr;

use crate::package::{AttrRef, FlavourKey, OrderKey, VersionOrder, VersionRecord};

use super::RuleError;

/// Predicate deciding whether one version of a package must be kept.
///
/// Rules are scoped to a single package name; only the version string is
/// passed in.
pub trait ProtectionRule: Send + Sync + Debug {
    fn label(&self) -> &str;
    fn protects(&self, version: &str) -> Result<bool, RuleError>;
}

/// Protects every version.
#[derive(Debug, Clone)]
pub struct KeepAll {
    label: String,
}

impl KeepAll {
    pub fn new(label: &str) -> Self {
        Self { label: label.to_string() }
    }
}

impl ProtectionRule for KeepAll {
    fn label(&self) -> &str {
        &self.label
    }

    fn protects(&self, _version: &str) -> Result<bool, RuleError> {
        Ok(true)
    }
}

/// Protects nothing.
#[derive(Debug, Clone)]
pub struct KeepNone {
    label: String,
}

impl KeepNone {
    pub fn new(label: &str) -> Self {
        Self { label: label.to_string() }
    }
}

impl ProtectionRule for KeepNone {
    fn label(&self) -> &str {
        &self.label
    }

    fn protects(&self, _version: &str) -> Result<bool, RuleError> {
        Ok(false)
    }
}

/// Protects versions matching a shell-style wildcard.
#[derive(Debug, Clone)]
pub struct KeepVersion {
    label: String,
    pattern: Pattern,
}

impl KeepVersion {
    pub fn new(label: &str, pattern: &str) -> Result<Self, RuleError> {
        let pattern = Pattern::new(pattern).map_err(|e| RuleError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            label: label.to_string(),
            pattern,
        })
    }
}

impl ProtectionRule for KeepVersion {
    fn label(&self) -> &str {
        &self.label
    }

    fn protects(&self, version: &str) -> Result<bool, RuleError> {
        Ok(self.pattern.matches(version))
    }
}

/// Protects the `limit` most recent versions of each flavour.
///
/// The version history is captured when the rule is built; asking about a
/// version outside of it is an error.
#[derive(Debug)]
pub struct KeepLatest {
    label: String,
    package: String,
    limit: usize,
    keys: HashMap<String, (FlavourKey, OrderKey)>,
    latest: HashMap<FlavourKey, HashSet<OrderKey>>,
}

impl KeepLatest {
    pub fn new(
        label: &str,
        package: &str,
        order: VersionOrder,
        limit: usize,
        history: &[VersionRecord],
    ) -> Result<Self, RuleError> {
        if limit == 0 {
            return Err(RuleError::InvalidLimit {
                package: package.to_string(),
            });
        }

        let mut keys = HashMap::new();
        for record in history {
            if record.package != package {
                return Err(RuleError::ForeignManifest {
                    expected: package.to_string(),
                    found: record.package.clone(),
                    version: record.full_version().to_string(),
                });
            }
            let version = record.full_version().to_string();
            if keys.contains_key(&version) {
                return Err(RuleError::DuplicateVersion {
                    package: package.to_string(),
                    version,
                });
            }
            debug!("Accounted {}/{} installed at {}", package, version, record.installed_at);
            keys.insert(version, order.canonic_key(record)?);
        }

        let latest = order
            .partition(history)?
            .into_iter()
            .map(|partition| {
                let skip = partition.versions.len().saturating_sub(limit);
                let newest: HashSet<OrderKey> = partition
                    .versions
                    .into_iter()
                    .skip(skip)
                    .map(|(key, _)| key)
                    .collect();
                (partition.flavour, newest)
            })
            .collect();

        Ok(Self {
            label: label.to_string(),
            package: package.to_string(),
            limit,
            keys,
            latest,
        })
    }
}

impl ProtectionRule for KeepLatest {
    fn label(&self) -> &str {
        &self.label
    }

    fn protects(&self, version: &str) -> Result<bool, RuleError> {
        let (flavour, key) = self.keys.get(version).ok_or_else(|| RuleError::VersionNotKnown {
            package: self.package.clone(),
            version: version.to_string(),
        })?;
        let protected = self.latest.get(flavour).is_some_and(|newest| newest.contains(key));
        debug!(
            "{}/{} among {} most recent of its flavour: {}",
            self.package, version, self.limit, protected
        );
        Ok(protected)
    }
}

/// Rule kinds as named in settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    KeepAll,
    KeepNone,
    KeepLatest,
    KeepVersion,
}

impl FromStr for RuleKind {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "always" | "keep" | "system" | "keepall" | "keep_all" | "keep-all" => Ok(RuleKind::KeepAll),
            "never" | "none" => Ok(RuleKind::KeepNone),
            "latest" => Ok(RuleKind::KeepLatest),
            "version" | "keep-version" => Ok(RuleKind::KeepVersion),
            _ => Err(RuleError::UnknownType(s.to_string())),
        }
    }
}

/// A protection rule entry of a package definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDescriptor {
    #[serde(rename = "type")]
    pub rule_type: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub version_pattern: Option<String>,
    #[serde(default)]
    pub attrs_order: Option<Vec<AttrRef>>,
    #[serde(default)]
    pub flavour_from: Option<Vec<AttrRef>>,
    #[serde(default)]
    pub latest_limit: Option<usize>,
}

impl RuleDescriptor {
    pub fn new(rule_type: &str) -> Self {
        Self {
            rule_type: rule_type.to_string(),
            label: None,
            version_pattern: None,
            attrs_order: None,
            flavour_from: None,
            latest_limit: None,
        }
    }

    pub fn kind(&self) -> Result<RuleKind, RuleError> {
        self.rule_type.parse()
    }

    /// Only `latest` rules look at the installed version history.
    pub fn needs_history(&self) -> bool {
        matches!(self.kind(), Ok(RuleKind::KeepLatest))
    }

    /// Instantiate the rule for `package`.
    pub fn build(&self, package: &str, history: &[VersionRecord]) -> Result<Box<dyn ProtectionRule>, RuleError> {
        let kind = self.kind()?;
        let label = match (&self.label, kind) {
            (Some(label), _) => label.clone(),
            (None, RuleKind::KeepLatest) => "latest".to_string(),
            (None, _) => self.rule_type.to_lowercase(),
        };

        let rule: Box<dyn ProtectionRule> = match kind {
            RuleKind::KeepAll => Box::new(KeepAll::new(&label)),
            RuleKind::KeepNone => Box::new(KeepNone::new(&label)),
            RuleKind::KeepVersion => {
                let pattern = self.version_pattern.as_deref().ok_or_else(|| RuleError::MissingField {
                    rule_type: self.rule_type.clone(),
                    field: "versionPattern",
                })?;
                Box::new(KeepVersion::new(&label, pattern)?)
            }
            RuleKind::KeepLatest => {
                let order = VersionOrder::from_refs(self.attrs_order.as_deref(), self.flavour_from.as_deref())?;
                let limit = self.latest_limit.unwrap_or(1);
                Box::new(KeepLatest::new(&label, package, order, limit, history)?)
            }
        };
        Ok(rule)
    }
}
