use anyhow::{Result, anyhow, bail};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::runtime::Runtime;

use super::{INSTALLED_FILES_LIST, InstallContext, InstallStep};

/// Run a command, then pick up the files it produced.
///
/// Without `cwd` the command runs in a fresh temporary directory which is
/// deleted once the installation succeeds. `files` maps package file names
/// to glob patterns, relative to the working directory unless absolute; the
/// most recent match of each becomes available to later stages.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ShellCmd {
    pub cmd: Vec<String>,
    #[serde(default)]
    pub files: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub asset_files: Vec<String>,
}

impl InstallStep for ShellCmd {
    fn name(&self) -> &'static str {
        "shell-cmd"
    }

    #[tracing::instrument(skip_all, fields(cmd = ?self.cmd))]
    fn execute<R: Runtime>(&self, ctx: &mut InstallContext<'_, R>) -> Result<()> {
        let runtime = ctx.runtime;
        let mut cmd: Vec<String> = self.cmd.iter().map(|token| ctx.format(token)).collect();
        if cmd.is_empty() {
            bail!("shell-cmd stage needs a non-empty \"cmd\"");
        }

        let (cwd, temporary) = match &self.cwd {
            Some(dir) => {
                let dir = PathBuf::from(ctx.format(dir));
                if !runtime.is_dir(&dir) {
                    runtime.create_dir_all(&dir)?;
                }
                (dir, false)
            }
            None => (ctx.temp_dir()?, true),
        };
        debug!("Working directory {:?}", cwd);

        if let Some(pkg_dir) = ctx.definitions.get("pkgDir") {
            let script = PathBuf::from(&cmd[0]);
            if script.starts_with(pkg_dir)
                && runtime.is_file(&script)
                && let Some(file_name) = script.file_name()
            {
                runtime.copy(&script, &cwd.join(file_name))?;
                cmd[0] = format!("./{}", file_name.to_string_lossy());
            }
        }
        for asset in &self.asset_files {
            let asset = PathBuf::from(ctx.format(asset));
            if !runtime.is_file(&asset) {
                bail!("No such asset file: {:?}", asset);
            }
            let file_name = asset
                .file_name()
                .ok_or_else(|| anyhow!("Asset file {:?} has no file name", asset))?;
            runtime.copy(&asset, &cwd.join(file_name))?;
        }

        let env = ctx.command_env()?;
        if let Err(e) = runtime.run_command(&cmd, &cwd, &env) {
            if temporary {
                warn!("Directory {:?} is kept for investigation", cwd);
            }
            return Err(e);
        }
        if temporary {
            ctx.cleanup_mut().add(cwd.clone());
        }

        for (name, patterns) in &self.files {
            let mut found = Vec::new();
            for pattern in patterns {
                let pattern = ctx.format(pattern);
                let pattern = if Path::new(&pattern).is_absolute() {
                    pattern
                } else {
                    cwd.join(&pattern).to_string_lossy().into_owned()
                };
                found.extend(runtime.glob(&pattern)?);
            }
            let Some(newest) = most_recent(runtime, found) else {
                bail!("No file(s) for \"{}\" provided after execution of shell command", name);
            };

            if name == INSTALLED_FILES_LIST {
                let list = runtime.read_to_string(&newest)?;
                ctx.record_all(
                    list.lines()
                        .map(str::trim)
                        .filter(|line| !line.is_empty())
                        .map(PathBuf::from),
                );
                continue;
            }
            info!("{} provided: {:?}", name, newest);
            ctx.set_package_file(name, newest);
        }
        Ok(())
    }
}

/// Latest modified of `paths`; later entries win ties.
fn most_recent<R: Runtime>(runtime: &R, paths: Vec<PathBuf>) -> Option<PathBuf> {
    let mut best: Option<(std::time::SystemTime, PathBuf)> = None;
    for path in paths {
        let modified = match runtime.modified(&path) {
            Ok(time) => time,
            Err(e) => {
                warn!("{:#}", e);
                continue;
            }
        };
        if best.as_ref().is_none_or(|(time, _)| modified >= *time) {
            best = Some((modified, path));
        }
    }
    best.map(|(_, path)| path)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::package::{PackageRegistry, VersionAttributes};
    use crate::runtime::RealRuntime;
    use crate::settings::Settings;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        dir: TempDir,
        settings: Settings,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let mut settings = Settings::default();
            settings.tmp_dir_prefix = Some(dir.path().join("build-").to_string_lossy().into_owned());
            settings.modulepath = dir.path().join("modulefiles");
            settings.definitions.insert("pkgDir".into(), dir.path().join("pkg").to_string_lossy().into_owned());
            fs::create_dir_all(dir.path().join("pkg")).unwrap();
            Self { dir, settings }
        }

        fn script(&self, name: &str, body: &str) -> PathBuf {
            let path = self.dir.path().join("pkg").join(name);
            fs::write(&path, format!("#!/bin/sh\nset -e\n{}\n", body)).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            path
        }
    }

    #[test]
    fn test_runs_local_script_and_collects_files() {
        let fx = Fixture::new();
        let script = fx.script(
            "build.sh",
            "echo \"$1\" > out-$1.txt\necho /opt/xz/bin/xz > files.txt\necho /opt/xz/lib >> files.txt",
        );
        let runtime = RealRuntime;
        let registry = PackageRegistry::new(&runtime, fx.dir.path().join("registry"));
        let mut ctx = InstallContext::new(&runtime, &registry, &fx.settings, "xz", VersionAttributes::new("5.6")).unwrap();

        let step = ShellCmd {
            cmd: vec![script.to_string_lossy().into_owned(), "{fullVersion}".into()],
            files: BTreeMap::from([
                ("dist-archive".to_string(), vec!["out-*.txt".to_string()]),
                (INSTALLED_FILES_LIST.to_string(), vec!["files.txt".to_string()]),
            ]),
            ..Default::default()
        };
        step.execute(&mut ctx).unwrap();

        let archive = ctx.package_file("dist-archive").unwrap().to_path_buf();
        assert_eq!(archive.file_name().unwrap(), "out-5.6.txt");
        assert_eq!(fs::read_to_string(&archive).unwrap(), "5.6\n");
        assert_eq!(
            ctx.installed_entries(),
            &[PathBuf::from("/opt/xz/bin/xz"), PathBuf::from("/opt/xz/lib")]
        );

        let build_dir = archive.parent().unwrap().to_path_buf();
        assert!(build_dir.join("build.sh").is_file());
        ctx.finish(false);
        assert!(!build_dir.exists());
    }

    #[test]
    fn test_failure_keeps_build_dir() {
        let fx = Fixture::new();
        let runtime = RealRuntime;
        let registry = PackageRegistry::new(&runtime, fx.dir.path().join("registry"));
        let mut ctx = InstallContext::new(&runtime, &registry, &fx.settings, "xz", VersionAttributes::new("5.6")).unwrap();

        let step = ShellCmd {
            cmd: vec!["sh".into(), "-c".into(), "touch partial; exit 4".into()],
            ..Default::default()
        };
        assert!(step.execute(&mut ctx).is_err());
        ctx.finish(true);

        let kept: Vec<_> = fs::read_dir(fx.dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("build-"))
            .collect();
        assert_eq!(kept.len(), 1);
        assert!(kept[0].path().join("partial").exists());
    }

    #[test]
    fn test_missing_output_is_an_error() {
        let fx = Fixture::new();
        let runtime = RealRuntime;
        let registry = PackageRegistry::new(&runtime, fx.dir.path().join("registry"));
        let mut ctx = InstallContext::new(&runtime, &registry, &fx.settings, "xz", VersionAttributes::new("5.6")).unwrap();

        let step = ShellCmd {
            cmd: vec!["true".into()],
            files: BTreeMap::from([("modulefile".to_string(), vec!["*.mod".to_string()])]),
            ..Default::default()
        };
        let err = step.execute(&mut ctx).unwrap_err();
        assert!(err.to_string().contains("\"modulefile\""));
    }

    #[test]
    fn test_explicit_cwd_and_assets() {
        let fx = Fixture::new();
        let asset = fx.dir.path().join("pkg/patch.diff");
        fs::write(&asset, "diff").unwrap();
        let work = fx.dir.path().join("work");
        let runtime = RealRuntime;
        let registry = PackageRegistry::new(&runtime, fx.dir.path().join("registry"));
        let mut ctx = InstallContext::new(&runtime, &registry, &fx.settings, "xz", VersionAttributes::new("5.6")).unwrap();

        let step = ShellCmd {
            cmd: vec!["sh".into(), "-c".into(), "cp patch.diff applied.diff".into()],
            cwd: Some(work.to_string_lossy().into_owned()),
            asset_files: vec!["{pkgDir}/patch.diff".into()],
            ..Default::default()
        };
        step.execute(&mut ctx).unwrap();
        ctx.finish(false);

        assert!(work.join("applied.diff").is_file());

        let step = ShellCmd {
            cmd: vec!["true".into()],
            cwd: Some(work.to_string_lossy().into_owned()),
            asset_files: vec!["{pkgDir}/missing.diff".into()],
            ..Default::default()
        };
        assert!(step.execute(&mut ctx).unwrap_err().to_string().contains("missing.diff"));
    }
}
