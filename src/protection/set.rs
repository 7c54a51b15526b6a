use anyhow::{Context, Result};
use glob::Pattern;
use log::{debug, warn};
use std::collections::HashMap;

use crate::package::{PackageKey, VersionRecord};

use super::RuleError;
use super::rule::{KeepVersion, ProtectionRule, RuleDescriptor};

/// Protection rules of every configured package plus ad hoc `--keep` entries.
#[derive(Debug, Default)]
pub struct ProtectionRuleSet {
    by_package: HashMap<String, Vec<Box<dyn ProtectionRule>>>,
    manual: Vec<(Pattern, KeepVersion)>,
}

impl ProtectionRuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build rules from package definitions.
    ///
    /// `definitions` yields each configured package with its rule
    /// descriptors, `None` when the package declares none. `history` is
    /// asked for the installed versions of a package only when one of its
    /// rules needs them.
    #[tracing::instrument(skip_all)]
    pub fn build<'d, I, F>(definitions: I, mut history: F) -> Result<Self>
    where
        I: IntoIterator<Item = (&'d str, Option<&'d [RuleDescriptor]>)>,
        F: FnMut(&str) -> Result<Vec<VersionRecord>>,
    {
        let mut set = Self::new();
        for (package, descriptors) in definitions {
            let Some(descriptors) = descriptors else {
                debug!("No protection rules for package {}", package);
                continue;
            };
            if descriptors.is_empty() {
                warn!("Package \"{}\" is not protected by a protection rule.", package);
            }

            let records = if descriptors.iter().any(RuleDescriptor::needs_history) {
                history(package)?
            } else {
                Vec::new()
            };

            let rules = set.by_package.entry(package.to_string()).or_default();
            for descriptor in descriptors {
                let rule = descriptor
                    .build(package, &records)
                    .with_context(|| format!("Invalid protection rule for package \"{}\"", package))?;
                debug!("Package \"{}\" protected with rule \"{}\"", package, rule.label());
                rules.push(rule);
            }
        }
        Ok(set)
    }

    pub fn insert(&mut self, package: &str, rule: Box<dyn ProtectionRule>) {
        self.by_package.entry(package.to_string()).or_default().push(rule);
    }

    /// Add a `name/versionGlob` rule for this invocation; the name may be a glob too.
    pub fn keep(&mut self, spec: &str) -> Result<(), RuleError> {
        let (name, version) = spec.split_once('/').ok_or_else(|| RuleError::InvalidKeep(spec.to_string()))?;
        let name_pattern = Pattern::new(name).map_err(|e| RuleError::InvalidPattern {
            pattern: name.to_string(),
            reason: e.to_string(),
        })?;
        let rule = KeepVersion::new(&format!("--keep {}", spec), version)?;
        self.manual.push((name_pattern, rule));
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.manual.is_empty() && self.by_package.values().all(Vec::is_empty)
    }

    /// Labels of the rules directly protecting `key`, in declaration order.
    pub fn matching_labels(&self, key: &PackageKey) -> Result<Vec<String>, RuleError> {
        let mut labels = Vec::new();
        if let Some(rules) = self.by_package.get(&key.name) {
            for rule in rules {
                if rule.protects(&key.version)? {
                    labels.push(rule.label().to_string());
                }
            }
        }
        for (name, rule) in &self.manual {
            if name.matches(&key.name) && rule.protects(&key.version)? {
                labels.push(rule.label().to_string());
            }
        }
        Ok(labels)
    }
}
