//! Install action - installs one package version through its install stages.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use log::{error, info, warn};
use std::collections::HashSet;
use std::path::PathBuf;

use crate::graph::DependencyGraph;
use crate::install::{InstallContext, run_stages};
use crate::package::{Manifest, PackageKey, PackageRegistry, VersionParser};
use crate::runtime::Runtime;
use crate::settings::{PackageDefinition, Settings};

#[derive(Debug, Clone, Default)]
pub struct InstallRequest {
    pub name: String,
    pub version: String,
    /// Installed packages to use for the declared dependencies (`--use`).
    pub uses: Vec<PackageKey>,
    pub modulescript: Option<PathBuf>,
}

pub struct InstallAction<'a, R: Runtime> {
    runtime: &'a R,
    registry: &'a PackageRegistry<'a, R>,
    settings: &'a Settings,
}

impl<'a, R: Runtime> InstallAction<'a, R> {
    pub fn new(runtime: &'a R, registry: &'a PackageRegistry<'a, R>, settings: &'a Settings) -> Self {
        Self {
            runtime,
            registry,
            settings,
        }
    }

    /// Install a package version and record it in the registry and graph.
    #[tracing::instrument(skip(self, graph))]
    pub fn install(&self, request: &InstallRequest, graph: &mut DependencyGraph) -> Result<Manifest> {
        let (name, definition) = self.definition(&request.name)?;
        if self.registry.is_installed(name, &request.version) {
            bail!(
                "Package \"{}\" of version \"{}\" is installed (file {:?} exists)",
                name,
                request.version,
                self.registry.manifest_path(name, &request.version)
            );
        }

        let parser = VersionParser::new(&definition.version_regex, definition.default_version_values.clone())
            .with_context(|| format!("Bad \"version-regex\" of package \"{}\"", name))?;
        let version = parser
            .parse(&request.version)
            .context("Please check the version string or correct the settings file")?;

        let mut ctx = InstallContext::new(self.runtime, self.registry, self.settings, name, version)?;
        ctx.modulescript = request.modulescript.clone();
        resolve_uses(&mut ctx, definition, &request.uses)?;

        if let Err(e) = run_stages(&definition.install_stages, &mut ctx) {
            error!("Failed to install \"{}\" of version \"{}\"", name, request.version);
            ctx.finish(true);
            return Err(e);
        }

        let manifest = Manifest {
            package: name.to_string(),
            version: ctx.version.clone(),
            installed_at: Utc::now().naive_utc(),
            fs_entries: ctx.installed_entries().to_vec(),
            stats: ctx.stats(),
            dependencies: ctx.dependency_keys(),
        };
        let path = match self.registry.save(&manifest) {
            Ok(path) => path,
            Err(e) => {
                ctx.finish(true);
                return Err(e);
            }
        };
        info!("Manifest written to {:?}", path);

        let key = manifest.key();
        if manifest.dependencies.is_empty() {
            graph.add_node(&key);
        }
        for dep in &manifest.dependencies {
            graph.add(&key, dep);
        }

        ctx.finish(false);
        info!(
            "Package \"{}\" of version \"{}\" installed ({})",
            name,
            manifest.full_version(),
            manifest.stats.summary()
        );
        Ok(manifest)
    }

    fn definition(&self, name: &str) -> Result<(&'a str, &'a PackageDefinition)> {
        let matches = self.settings.matching_packages(name)?;
        match matches.as_slice() {
            [] => bail!("Package \"{}\" is not known", name),
            [(found, definition)] => Ok((*found, *definition)),
            many => {
                let names: Vec<&str> = many.iter().map(|(n, _)| *n).collect();
                bail!("Multiple packages match \"{}\": {}", name, names.join(", "))
            }
        }
    }
}

/// Check `--use` packages against the declared dependencies.
fn resolve_uses<R: Runtime>(ctx: &mut InstallContext<'_, R>, definition: &PackageDefinition, uses: &[PackageKey]) -> Result<()> {
    let declared: HashSet<&str> = definition.depends.iter().map(|d| d.name.as_str()).collect();
    let mut used = HashSet::new();
    for key in uses {
        if !declared.contains(key.name.as_str()) {
            warn!("\"--use {}\" is not a dependency of \"{}\", ignored", key, ctx.package);
            continue;
        }
        ctx.resolve_dependency(key)
            .with_context(|| format!("Package given with --use {} must be installed", key))?;
        used.insert(key.name.clone());
    }

    for dependency in &definition.depends {
        if used.contains(&dependency.name) {
            continue;
        }
        if dependency.required {
            bail!(
                "Package \"{}\" requires \"{}\", please provide it with --use {}/<version>",
                ctx.package,
                dependency.name,
                dependency.name
            );
        }
        info!("Optional dependency \"{}\" of \"{}\" is not used", dependency.name, ctx.package);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::key;
    use crate::install::{ShellCmd, StepDescriptor};
    use crate::runtime::RealRuntime;
    use crate::settings::DependencySpec;
    use crate::test_utils::manifest_json;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        dir: TempDir,
        settings: Settings,
    }

    impl Fixture {
        fn new(definitions: Vec<(&str, PackageDefinition)>) -> Self {
            let dir = tempdir().unwrap();
            let mut settings = Settings::default();
            settings.registry_dir = dir.path().join("registry");
            settings.modulepath = dir.path().join("modulefiles");
            settings.tmp_dir_prefix = Some(dir.path().join("build-").to_string_lossy().into_owned());
            fs::create_dir_all(&settings.registry_dir).unwrap();
            for (name, definition) in definitions {
                settings.packages.insert(name.to_string(), definition);
            }
            Self { dir, settings }
        }

        fn preinstall(&self, name: &str, version: &str) {
            let dir = self.settings.registry_dir.join(name);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join(format!("{}.json", version)), manifest_json(name, version, &[])).unwrap();
        }
    }

    fn depends(names: &[(&str, bool)]) -> Vec<DependencySpec> {
        names
            .iter()
            .map(|(name, required)| DependencySpec {
                name: name.to_string(),
                required: *required,
            })
            .collect()
    }

    fn request(name: &str, version: &str, uses: &[&str]) -> InstallRequest {
        InstallRequest {
            name: name.into(),
            version: version.into(),
            uses: uses.iter().map(|u| key(u)).collect(),
            modulescript: None,
        }
    }

    #[test]
    fn test_install_without_stages_records_manifest_and_graph() {
        let fx = Fixture::new(vec![(
            "root",
            PackageDefinition {
                version_regex: vec![r"^(?P<major>\d+)\.(?P<minor>\d+)$".into()],
                depends: depends(&[("xz", true), ("gsl", false)]),
                ..Default::default()
            },
        )]);
        fx.preinstall("xz", "5.6");
        let runtime = RealRuntime;
        let registry = PackageRegistry::new(&runtime, fx.settings.registry_dir.clone());
        let mut graph = DependencyGraph::new();

        let manifest = InstallAction::new(&runtime, &registry, &fx.settings)
            .install(&request("root", "6.30", &["xz/5.6"]), &mut graph)
            .unwrap();

        assert_eq!(manifest.key(), key("root/6.30"));
        assert_eq!(manifest.version.value("major").to_string(), "6");
        assert_eq!(manifest.dependencies, vec![key("xz/5.6")]);
        assert!(registry.is_installed("root", "6.30"));
        assert_eq!(graph.depends_on(&key("root/6.30")).unwrap(), vec![key("xz/5.6")]);
    }

    #[test]
    fn test_install_refuses_known_problems() {
        let fx = Fixture::new(vec![
            (
                "root",
                PackageDefinition {
                    version_regex: vec![r"^\d+\.\d+$".into()],
                    depends: depends(&[("xz", true)]),
                    ..Default::default()
                },
            ),
            ("root-data", PackageDefinition::default()),
            ("xz", PackageDefinition::default()),
        ]);
        fx.preinstall("xz", "5.6");
        let runtime = RealRuntime;
        let registry = PackageRegistry::new(&runtime, fx.settings.registry_dir.clone());
        let action = InstallAction::new(&runtime, &registry, &fx.settings);
        let mut graph = DependencyGraph::new();

        let err = action.install(&request("zlib", "1.3", &[]), &mut graph).unwrap_err();
        assert!(err.to_string().contains("not known"));

        let err = action.install(&request("root*", "6.30", &[]), &mut graph).unwrap_err();
        assert!(err.to_string().contains("Multiple packages"));

        let err = action.install(&request("xz", "5.6", &[]), &mut graph).unwrap_err();
        assert!(err.to_string().contains("is installed"));

        let err = action.install(&request("root", "v6", &["xz/5.6"]), &mut graph).unwrap_err();
        assert!(format!("{:#}", err).contains("v6"));

        let err = action.install(&request("root", "6.30", &[]), &mut graph).unwrap_err();
        assert!(err.to_string().contains("requires \"xz\""));

        let err = action.install(&request("root", "6.30", &["xz/9.9"]), &mut graph).unwrap_err();
        assert!(err.to_string().contains("xz/9.9"));

        assert!(!registry.is_installed("root", "6.30"));
        assert_eq!(graph.node_count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_install_runs_stages_and_cleans_up() {
        let fx = Fixture::new(vec![(
            "xz",
            PackageDefinition {
                install_stages: vec![StepDescriptor::ShellCmd(ShellCmd {
                    cmd: vec![
                        "sh".into(),
                        "-c".into(),
                        "mkdir -p {root}/opt/xz && echo xz > {root}/opt/xz/xz && echo {root}/opt/xz/xz > list.txt".into(),
                    ],
                    files: [("installed-files-list".to_string(), vec!["list.txt".to_string()])].into(),
                    ..Default::default()
                })],
                ..Default::default()
            },
        )]);
        let mut settings = fx.settings.clone();
        settings
            .definitions
            .insert("root".into(), fx.dir.path().to_string_lossy().into_owned());
        let runtime = RealRuntime;
        let registry = PackageRegistry::new(&runtime, settings.registry_dir.clone());
        let mut graph = DependencyGraph::new();

        let manifest = InstallAction::new(&runtime, &registry, &settings)
            .install(&request("xz", "5.6", &[]), &mut graph)
            .unwrap();

        assert_eq!(manifest.fs_entries, vec![fx.dir.path().join("opt/xz/xz")]);
        assert_eq!(manifest.stats.n_files, 1);
        assert_eq!(manifest.stats.size, 3);
        assert!(graph.contains(&key("xz/5.6")));
        let leftovers = fs::read_dir(fx.dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("build-"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_stage_leaves_no_manifest() {
        let fx = Fixture::new(vec![(
            "xz",
            PackageDefinition {
                install_stages: vec![StepDescriptor::ShellCmd(ShellCmd {
                    cmd: vec!["false".into()],
                    ..Default::default()
                })],
                ..Default::default()
            },
        )]);
        let runtime = RealRuntime;
        let registry = PackageRegistry::new(&runtime, fx.settings.registry_dir.clone());
        let mut graph = DependencyGraph::new();

        let err = InstallAction::new(&runtime, &registry, &fx.settings)
            .install(&request("xz", "5.6", &[]), &mut graph)
            .unwrap_err();

        assert!(err.to_string().contains("shell-cmd"));
        assert!(!registry.is_installed("xz", "5.6"));
        assert!(!graph.is_dirty());
    }
}
