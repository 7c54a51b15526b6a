use log::{error, info, warn};
use std::path::{Path, PathBuf};

use crate::runtime::Runtime;

/// Something to take care of once an installation ends.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitHandler {
    /// A temporary path, deleted on a normal exit and kept after a failure.
    Path(PathBuf),
    /// A pair of commands finishing an external operation: `on_success`
    /// runs on a normal exit, `on_failure` after a failure.
    Commands {
        on_success: Vec<String>,
        on_failure: Vec<String>,
        cwd: PathBuf,
    },
}

/// On-exit handlers registered while installing a package.
///
/// On a normal exit temporary paths are deleted. After a failure they are
/// kept for inspection.
#[derive(Default, Debug)]
pub struct CleanupContext {
    #[cfg(test)]
    pub handlers: Vec<ExitHandler>,
    #[cfg(not(test))]
    handlers: Vec<ExitHandler>,
}

impl CleanupContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a path to be handled on exit
    pub fn add(&mut self, path: PathBuf) {
        self.handlers.push(ExitHandler::Path(path));
    }

    /// Register commands to run on exit, depending on how the install ended
    pub fn add_commands(&mut self, on_success: Vec<String>, on_failure: Vec<String>, cwd: PathBuf) {
        self.handlers.push(ExitHandler::Commands {
            on_success,
            on_failure,
            cwd,
        });
    }

    /// Forget a path (e.g., when it became part of the installation)
    pub fn remove(&mut self, path: &Path) {
        self.handlers
            .retain(|h| !matches!(h, ExitHandler::Path(p) if p == path));
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the on-exit handling, most recent handler first.
    pub fn finish<R: Runtime>(&mut self, runtime: &R, emergency: bool) {
        info!(
            "Performing on-exit cleanup procedures ({})",
            if emergency { "emergency" } else { "normal" }
        );
        if self.handlers.is_empty() {
            info!("    (no on-exit handlers)");
        }
        for handler in self.handlers.drain(..).rev() {
            match handler {
                ExitHandler::Path(path) => Self::finish_path(runtime, &path, emergency),
                ExitHandler::Commands {
                    on_success,
                    on_failure,
                    cwd,
                } => {
                    let cmd = if emergency {
                        warn!(" - running {:?}", on_failure.join(" "));
                        on_failure
                    } else {
                        info!(" + running {:?}", on_success.join(" "));
                        on_success
                    };
                    if let Err(e) = runtime.run_command(&cmd, &cwd, &[]) {
                        error!("On-exit command {:?} failed: {:#}", cmd.join(" "), e);
                    }
                }
            }
        }
    }

    fn finish_path<R: Runtime>(runtime: &R, path: &Path, emergency: bool) {
        if !runtime.exists(path) {
            return;
        }
        if emergency {
            warn!(" - {:?} is kept for inspection", path);
            return;
        }
        info!(" + deleting {:?}", path);
        let result = if runtime.is_dir(path) {
            runtime.remove_dir_all(path)
        } else {
            runtime.remove_file(path)
        };
        if let Err(e) = result {
            warn!("Failed to clean up {:?}: {:#}", path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{MockRuntime, RealRuntime};
    use anyhow::anyhow;
    use mockall::Sequence;
    use std::fs;
    use tempfile::tempdir;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_cleanup_context_add_remove() {
        let mut ctx = CleanupContext::new();
        let path = PathBuf::from("/tmp/test");

        ctx.add(path.clone());
        ctx.add_commands(strings(&["true"]), strings(&["false"]), PathBuf::from("/"));
        assert_eq!(ctx.handlers.len(), 2);

        ctx.remove(&path);
        assert_eq!(ctx.handlers.len(), 1);
        assert!(matches!(ctx.handlers[0], ExitHandler::Commands { .. }));
    }

    #[test]
    fn test_normal_exit_deletes_files_and_dirs() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("test.txt");
        fs::write(&file_path, "test").unwrap();
        let sub_dir = dir.path().join("subdir");
        fs::create_dir(&sub_dir).unwrap();
        fs::write(sub_dir.join("file.txt"), "test").unwrap();

        let mut ctx = CleanupContext::new();
        ctx.add(file_path.clone());
        ctx.add(sub_dir.clone());
        ctx.finish(&RealRuntime, false);

        assert!(!file_path.exists());
        assert!(!sub_dir.exists());
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_emergency_exit_keeps_paths() {
        let mut runtime = MockRuntime::new();
        runtime.expect_exists().returning(|_| true);
        runtime.expect_remove_dir_all().never();
        runtime.expect_remove_file().never();

        let mut ctx = CleanupContext::new();
        ctx.add(PathBuf::from("/tmp/sharepkg-build"));
        ctx.finish(&runtime, true);

        assert!(ctx.is_empty());
    }

    #[test]
    fn test_missing_paths_are_skipped() {
        let mut runtime = MockRuntime::new();
        runtime.expect_exists().returning(|_| false);
        runtime.expect_is_dir().never();

        let mut ctx = CleanupContext::new();
        ctx.add(PathBuf::from("/tmp/gone"));
        ctx.finish(&runtime, false);
    }

    #[test]
    fn test_commands_follow_exit_kind() {
        for (emergency, expected) in [(false, "publish"), (true, "abort")] {
            let mut runtime = MockRuntime::new();
            runtime
                .expect_run_command()
                .withf(move |cmd, cwd, env| cmd[0] == expected && cwd == Path::new("/") && env.is_empty())
                .times(1)
                .returning(|_, _, _| Ok(String::new()));

            let mut ctx = CleanupContext::new();
            ctx.add_commands(strings(&["publish"]), strings(&["abort"]), PathBuf::from("/"));
            ctx.finish(&runtime, emergency);
            assert!(ctx.is_empty());
        }
    }

    #[test]
    fn test_handlers_run_most_recent_first_despite_failures() {
        let mut runtime = MockRuntime::new();
        let mut seq = Sequence::new();
        runtime
            .expect_exists()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| true);
        runtime
            .expect_is_dir()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| true);
        runtime
            .expect_remove_dir_all()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        runtime
            .expect_run_command()
            .withf(|cmd, _, _| cmd == ["publish"])
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Err(anyhow!("publish failed")));

        let mut ctx = CleanupContext::new();
        ctx.add_commands(strings(&["publish"]), strings(&["abort"]), PathBuf::from("/"));
        ctx.add(PathBuf::from("/tmp/sharepkg-build"));
        ctx.finish(&runtime, false);

        assert!(ctx.is_empty());
    }
}
