//! Subprocess execution.

use anyhow::{Context, Result, bail};
use log::debug;
use std::path::Path;
use std::process::Command;

use super::RealRuntime;

impl RealRuntime {
    #[tracing::instrument(skip(self, env))]
    pub(crate) fn run_command_impl(&self, cmd: &[String], cwd: &Path, env: &[(String, String)]) -> Result<String> {
        let Some((program, args)) = cmd.split_first() else {
            bail!("Empty command");
        };

        debug!("Running {:?} in {:?}", cmd, cwd);
        let output = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .output()
            .with_context(|| format!("Failed to start command {:?}", program))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        for line in combined.lines() {
            debug!("  | {}", line);
        }

        if !output.status.success() {
            bail!(
                "Command {:?} failed with {}:\n{}",
                cmd.join(" "),
                output.status,
                combined.trim_end()
            );
        }
        Ok(combined)
    }
}
