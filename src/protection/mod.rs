//! Protection rules.
//!
//! A rule decides whether a given version of a package must be kept. Rules
//! are configured per package in settings and collected into a
//! [`ProtectionRuleSet`]; propagation along dependencies is done by the
//! dependency graph.

mod rule;
mod set;

pub use rule::{KeepAll, KeepLatest, KeepNone, KeepVersion, ProtectionRule, RuleDescriptor, RuleKind};
pub use set::ProtectionRuleSet;

use thiserror::Error;

use crate::package::VersionError;

#[derive(Debug, Error, PartialEq)]
pub enum RuleError {
    #[error("unknown protection rule type '{0}'")]
    UnknownType(String),

    #[error("protection rule '{rule_type}' requires '{field}'")]
    MissingField { rule_type: String, field: &'static str },

    #[error("invalid wildcard '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("invalid keep expression '{0}', expected name/versionPattern")]
    InvalidKeep(String),

    #[error("latest-versions limit of package '{package}' must be at least 1")]
    InvalidLimit { package: String },

    #[error("{package}/{version} is not known")]
    VersionNotKnown { package: String, version: String },

    #[error("manifest of {found}/{version} is inconsistent: package '{expected}' expected")]
    ForeignManifest {
        expected: String,
        found: String,
        version: String,
    },

    #[error("installed manifests inconsistent: version {version} of {package} installed twice")]
    DuplicateVersion { package: String, version: String },

    #[error(transparent)]
    Version(#[from] VersionError),
}
