use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::runtime::Runtime;

use super::{InstallContext, InstallStep, MODULEFILE};

/// Copy the `modulefile` package file to `<modulepath>/<name>/<fullVersion>`.
///
/// With `parseDependencies` the `prereq-all` and `depends-on` commands of
/// the modulefile are recorded as dependencies of the package.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct InstallModulefile {
    #[serde(default)]
    pub parse_dependencies: bool,
}

impl InstallStep for InstallModulefile {
    fn name(&self) -> &'static str {
        "install-modulefile"
    }

    #[tracing::instrument(skip_all)]
    fn execute<R: Runtime>(&self, ctx: &mut InstallContext<'_, R>) -> Result<()> {
        let runtime = ctx.runtime;
        let source = ctx.package_file(MODULEFILE)?.to_path_buf();
        let dest = ctx
            .settings
            .modulepath
            .join(&ctx.package)
            .join(ctx.version.full_version());

        if self.parse_dependencies {
            let content = runtime.read_to_string(&source)?;
            for (name, version) in modulefile_dependencies(&content) {
                ctx.depends(&name, &version)
                    .with_context(|| format!("Failed to resolve dependency \"{}/{}\" with available modules", name, version))?;
                info!("Depends on {}/{} (saved)", name, version);
            }
        }

        if let Some(parent) = dest.parent()
            && !runtime.is_dir(parent)
        {
            runtime.create_dir_all(parent)?;
        }
        runtime
            .copy(&source, &dest)
            .with_context(|| format!("Failed to install modulefile to {:?}", dest))?;
        info!("Modulefile {:?} installed", dest);
        ctx.record(dest);
        Ok(())
    }
}

/// `name/version` references of `prereq-all` and `depends-on` lines.
///
/// Options and references that are not exactly `name/version` are skipped
/// with a warning, as are dependency commands that can not be tracked.
pub fn modulefile_dependencies(content: &str) -> Vec<(String, String)> {
    let mut result = Vec::new();
    for line in content.lines() {
        let mut tokens = line.split_whitespace();
        let Some(command) = tokens.next() else {
            continue;
        };
        match command {
            "prereq-all" | "depends-on" => {
                for token in tokens {
                    if token.starts_with("--") {
                        warn!("Unsupported module dependency option \"{}\", ignored", token);
                        continue;
                    }
                    match token.split_once('/') {
                        Some((name, version)) if !version.contains('/') => {
                            result.push((name.to_string(), version.to_string()));
                        }
                        _ => warn!("Unsupported modulefile reference \"{}\", ignored", token),
                    }
                }
            }
            "prereq" | "prereq-any" | "always-load" => {
                warn!("Unsupported module dependency command \"{}\", dependency is not tracked", command);
            }
            _ => {}
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::{PackageKey, PackageRegistry, VersionAttributes};
    use crate::runtime::RealRuntime;
    use crate::settings::Settings;
    use crate::test_utils::manifest_json;
    use std::fs;
    use tempfile::tempdir;

    const MODULEFILE_TEXT: &str = "#%Module1.0\n\
        prereq-all xz/5.6 --optional gsl/2.7\n\
        depends-on cmake\n\
        prereq gcc/13\n\
        setenv ROOTSYS /opt/root\n";

    #[test]
    fn test_modulefile_dependencies() {
        assert_eq!(
            modulefile_dependencies(MODULEFILE_TEXT),
            vec![("xz".to_string(), "5.6".to_string()), ("gsl".to_string(), "2.7".to_string())]
        );
        assert!(modulefile_dependencies("depends-on a/b/c\n\n").is_empty());
    }

    #[test]
    fn test_install_modulefile_with_dependencies() {
        let dir = tempdir().unwrap();
        let registry_dir = dir.path().join("registry");
        for (name, version) in [("xz", "5.6"), ("gsl", "2.7")] {
            fs::create_dir_all(registry_dir.join(name)).unwrap();
            fs::write(
                registry_dir.join(name).join(format!("{}.json", version)),
                manifest_json(name, version, &[]),
            )
            .unwrap();
        }
        let source = dir.path().join("root.mod");
        fs::write(&source, MODULEFILE_TEXT).unwrap();

        let runtime = RealRuntime;
        let registry = PackageRegistry::new(&runtime, registry_dir);
        let mut settings = Settings::default();
        settings.modulepath = dir.path().join("modulefiles");
        let mut ctx = InstallContext::new(&runtime, &registry, &settings, "root", VersionAttributes::new("6.30")).unwrap();
        ctx.set_package_file(MODULEFILE, source);

        InstallModulefile { parse_dependencies: true }.execute(&mut ctx).unwrap();

        let dest = dir.path().join("modulefiles/root/6.30");
        assert_eq!(fs::read_to_string(&dest).unwrap(), MODULEFILE_TEXT);
        assert_eq!(ctx.installed_entries(), &[dest]);
        assert_eq!(
            ctx.dependency_keys(),
            vec![PackageKey::new("xz", "5.6"), PackageKey::new("gsl", "2.7")]
        );
    }

    #[test]
    fn test_unresolved_dependency_fails() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("root.mod");
        fs::write(&source, "prereq-all xz/5.6\n").unwrap();

        let runtime = RealRuntime;
        let registry = PackageRegistry::new(&runtime, dir.path().join("registry"));
        let mut settings = Settings::default();
        settings.modulepath = dir.path().join("modulefiles");
        let mut ctx = InstallContext::new(&runtime, &registry, &settings, "root", VersionAttributes::new("6.30")).unwrap();
        ctx.set_package_file(MODULEFILE, source);

        let err = InstallModulefile { parse_dependencies: true }.execute(&mut ctx).unwrap_err();
        assert!(err.to_string().contains("xz/5.6"));
        assert!(!dir.path().join("modulefiles/root/6.30").exists());
    }
}
