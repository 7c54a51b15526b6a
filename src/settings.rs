//! Settings file and package definitions.
//!
//! The settings file is JSON:
//!
//! ```json
//! {
//!   "packages-registry-dir": "{root}/registry.d",
//!   "definitions": {"root": "/cvmfs/sw.example.org", "platform": "x86_64-el9-gcc13-opt"},
//!   "tmp-dir-prefix": "sharepkg-",
//!   "modulepath": "{root}/modulefiles",
//!   "packages": [
//!     {"name": "xz", "version-regex": ["^(?P<major>\\d+)\\.(?P<minor>\\d+)"]},
//!     "{pwd}/packages/root.json",
//!     "{pwd}/packages/*/def.json"
//!   ]
//! }
//! ```
//!
//! `{key}` placeholders refer to `definitions` and are resolved until
//! nothing changes; `$VAR` and `${VAR}` are taken from the environment.

use anyhow::{Context, Result, anyhow, bail};
use glob::Pattern;
use log::{debug, info, warn};
use regex::{Captures, Regex};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::install::StepDescriptor;
use crate::package::{AttrValue, VersionAttributes};
use crate::protection::RuleDescriptor;
use crate::runtime::Runtime;

pub const DEFAULT_SETTINGS_FILE: &str = "./sharepkg-settings.json";
pub const SETTINGS_ENV: &str = "SHAREPKG_SETTINGS";
pub const DEFAULT_REGISTRY_DIR: &str = "./registry.d";
pub const DEFAULT_MODULEPATH: &str = "/usr/share/modules/modulefiles/";

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{|\}\}|\{([A-Za-z_][A-Za-z0-9_.-]*)\}").expect("valid placeholder regex"));
static ENV_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))").expect("valid variable regex")
});

/// Substitute `{key}` placeholders. `{{` and `}}` yield literal braces;
/// unknown keys and `${VAR}` references are left untouched.
pub fn interpolate(template: &str, definitions: &BTreeMap<String, String>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            let whole = caps.get(0).map_or("", |m| m.as_str());
            let Some(key) = caps.get(1) else {
                return whole[..1].to_string();
            };
            let preceded_by_dollar = caps
                .get(0)
                .is_some_and(|m| m.start() > 0 && template.as_bytes()[m.start() - 1] == b'$');
            match definitions.get(key.as_str()) {
                Some(value) if !preceded_by_dollar => value.clone(),
                _ => whole.to_string(),
            }
        })
        .into_owned()
}

/// Expand `$VAR` and `${VAR}`; unset variables are left as they are.
pub fn expand_env<R: Runtime>(runtime: &R, value: &str) -> String {
    ENV_VAR
        .replace_all(value, |caps: &Captures| {
            let name = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
            runtime
                .env_var(name)
                .unwrap_or_else(|_| caps.get(0).map_or("", |m| m.as_str()).to_string())
        })
        .into_owned()
}

/// Interpolate then expand environment variables.
pub fn format_value<R: Runtime>(runtime: &R, template: &str, definitions: &BTreeMap<String, String>) -> String {
    expand_env(runtime, &interpolate(template, definitions))
}

/// Resolve cross references between definitions. A reference cycle is an
/// error naming the chain of keys.
pub(crate) fn resolve_definitions(definitions: BTreeMap<String, String>) -> Result<BTreeMap<String, String>> {
    let mut resolved = BTreeMap::new();
    let mut stack = Vec::new();
    for key in definitions.keys() {
        resolve_key(key, &definitions, &mut resolved, &mut stack)?;
    }
    Ok(resolved)
}

fn resolve_key(
    key: &str,
    raw: &BTreeMap<String, String>,
    resolved: &mut BTreeMap<String, String>,
    stack: &mut Vec<String>,
) -> Result<()> {
    if resolved.contains_key(key) {
        return Ok(());
    }
    if stack.iter().any(|k| k == key) {
        bail!(
            "Definition \"{}\" is recursive: {} -> {}",
            key,
            stack.join(" -> "),
            key
        );
    }
    let Some(value) = raw.get(key) else {
        return Ok(());
    };

    stack.push(key.to_string());
    for caps in PLACEHOLDER.captures_iter(value) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let preceded_by_dollar = whole.start() > 0 && value.as_bytes()[whole.start() - 1] == b'$';
        if !preceded_by_dollar && raw.contains_key(name.as_str()) {
            resolve_key(name.as_str(), raw, resolved, stack)?;
        }
    }
    stack.pop();

    let value = interpolate(value, resolved);
    resolved.insert(key.to_string(), value);
    Ok(())
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct DependencySpec {
    pub name: String,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

/// How to recognise, install and protect one package.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct PackageDefinition {
    #[serde(default)]
    pub version_regex: Vec<String>,
    #[serde(default)]
    pub default_version_values: BTreeMap<String, AttrValue>,
    #[serde(default)]
    pub depends: Vec<DependencySpec>,
    #[serde(default)]
    pub install_stages: Vec<StepDescriptor>,
    #[serde(default)]
    pub protection_rules: Option<Vec<RuleDescriptor>>,
    #[serde(default)]
    pub definitions: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct NamedDefinition {
    name: Option<String>,
    #[serde(flatten)]
    definition: PackageDefinition,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
struct SettingsFile {
    packages_registry_dir: Option<String>,
    #[serde(default)]
    definitions: BTreeMap<String, String>,
    tmp_dir_prefix: Option<String>,
    modulepath: Option<String>,
    #[serde(default)]
    packages: Vec<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub registry_dir: PathBuf,
    pub definitions: BTreeMap<String, String>,
    pub tmp_dir_prefix: Option<String>,
    pub modulepath: PathBuf,
    pub packages: BTreeMap<String, PackageDefinition>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            registry_dir: PathBuf::from(DEFAULT_REGISTRY_DIR),
            definitions: BTreeMap::new(),
            tmp_dir_prefix: None,
            modulepath: PathBuf::from(DEFAULT_MODULEPATH),
            packages: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Load a settings file; `defines` are `key=value` overrides.
    #[tracing::instrument(skip(runtime, defines))]
    pub fn load<R: Runtime>(runtime: &R, path: &Path, defines: &[String]) -> Result<Self> {
        if !runtime.is_file(path) {
            bail!("Settings file {:?} does not exist or is not a file", path);
        }
        let content = runtime.read_to_string(path)?;
        let file: SettingsFile =
            serde_json::from_str(&content).with_context(|| format!("Malformed settings file {:?}", path))?;
        let settings_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();

        let mut definitions = BTreeMap::new();
        definitions.insert("pwd".to_string(), runtime.current_dir()?.to_string_lossy().into_owned());
        for (key, value) in &file.definitions {
            definitions.insert(key.clone(), expand_env(runtime, value));
        }
        for define in defines {
            let (key, value) = define
                .split_once('=')
                .ok_or_else(|| anyhow!("Invalid definition '{}', expected key=value", define))?;
            definitions.insert(key.to_string(), value.to_string());
        }
        let definitions = resolve_definitions(definitions)?;

        let format = |value: &str| format_value(runtime, value, &definitions);
        let mut settings = Settings {
            registry_dir: PathBuf::from(format(file.packages_registry_dir.as_deref().unwrap_or(DEFAULT_REGISTRY_DIR))),
            tmp_dir_prefix: file.tmp_dir_prefix.as_deref().map(format),
            modulepath: PathBuf::from(format(file.modulepath.as_deref().unwrap_or(DEFAULT_MODULEPATH))),
            definitions: definitions.clone(),
            packages: BTreeMap::new(),
        };

        for entry in &file.packages {
            settings.load_package_entry(runtime, entry, &settings_dir)?;
        }

        if settings.packages.is_empty() {
            warn!("No package definitions loaded.");
        } else {
            info!("{} package(s) known overall.", settings.packages.len());
        }
        Ok(settings)
    }

    fn load_package_entry<R: Runtime>(
        &mut self,
        runtime: &R,
        entry: &serde_json::Value,
        settings_dir: &Path,
    ) -> Result<()> {
        match entry {
            serde_json::Value::Object(_) => {
                let named: NamedDefinition =
                    serde_json::from_value(entry.clone()).context("Malformed inline package definition")?;
                let name = named.name.ok_or_else(|| anyhow!("Inline package definition without \"name\""))?;
                self.insert_package(name, named.definition, settings_dir, None);
            }
            serde_json::Value::String(location) => {
                let location = format_value(runtime, location, &self.definitions);
                if runtime.is_file(Path::new(&location)) {
                    let path = PathBuf::from(&location);
                    let named = load_definition_file(runtime, &path)?;
                    let name = named
                        .name
                        .ok_or_else(|| anyhow!("Package definition {:?} has no \"name\"", path))?;
                    self.insert_package(name, named.definition, path.parent().unwrap_or(settings_dir), Some(&path));
                    return Ok(());
                }

                debug!("Getting package definitions from {}", location);
                let matches = runtime.glob(&location)?;
                if matches.is_empty() {
                    warn!("No packages found in {}", location);
                }
                for path in matches {
                    let Some(pkg_dir) = path.parent() else { continue };
                    let Some(name) = pkg_dir.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                        continue;
                    };
                    debug!("Loading package definition from {:?} for package \"{}\"", path, name);
                    let named = load_definition_file(runtime, &path)?;
                    self.insert_package(name, named.definition, pkg_dir, Some(&path));
                }
            }
            other => bail!("Package entry must be an object or a path, got {}", other),
        }
        Ok(())
    }

    fn insert_package(&mut self, name: String, mut definition: PackageDefinition, pkg_dir: &Path, file: Option<&Path>) {
        definition
            .definitions
            .entry("pkgDir".to_string())
            .or_insert_with(|| pkg_dir.to_string_lossy().into_owned());
        if let Some(file) = file {
            definition
                .definitions
                .entry("pkgFile".to_string())
                .or_insert_with(|| file.to_string_lossy().into_owned());
        }
        if self.packages.contains_key(&name) {
            warn!("Package \"{}\" defined more than once, last definition wins", name);
        }
        self.packages.insert(name, definition);
    }

    pub fn package(&self, name: &str) -> Option<&PackageDefinition> {
        self.packages.get(name)
    }

    /// Configured packages whose name matches a shell-style wildcard.
    pub fn matching_packages(&self, pattern: &str) -> Result<Vec<(&str, &PackageDefinition)>> {
        let pattern = Pattern::new(pattern).with_context(|| format!("Invalid package name pattern '{}'", pattern))?;
        Ok(self
            .packages
            .iter()
            .filter(|(name, _)| pattern.matches(name))
            .map(|(name, definition)| (name.as_str(), definition))
            .collect())
    }

    /// Package names with their protection rules, as consumed by
    /// [`ProtectionRuleSet::build`](crate::protection::ProtectionRuleSet::build).
    pub fn protection_definitions(&self) -> impl Iterator<Item = (&str, Option<&[RuleDescriptor]>)> {
        self.packages
            .iter()
            .map(|(name, definition)| (name.as_str(), definition.protection_rules.as_deref()))
    }

    /// Values available to `{key}` placeholders of a package being
    /// installed: version attributes, then global definitions, then the
    /// package's own.
    pub fn definitions_for(&self, package: &str, version: &VersionAttributes) -> BTreeMap<String, String> {
        let mut result: BTreeMap<String, String> = version
            .iter()
            .filter(|(_, value)| !matches!(value, AttrValue::Null))
            .map(|(key, value)| (key.clone(), value.to_string()))
            .collect();
        result.extend(self.definitions.clone());
        if let Some(definition) = self.packages.get(package) {
            result.extend(definition.definitions.clone());
        }
        result
    }
}

fn load_definition_file<R: Runtime>(runtime: &R, path: &Path) -> Result<NamedDefinition> {
    let content = runtime.read_to_string(path)?;
    serde_json::from_str(&content).with_context(|| format!("Malformed package definition {:?}", path))
}
