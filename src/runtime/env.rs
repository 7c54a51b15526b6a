//! Environment and working directory operations.

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

use super::RealRuntime;

impl RealRuntime {
    #[tracing::instrument(skip(self))]
    pub(crate) fn env_var_impl(&self, key: &str) -> Result<String, env::VarError> {
        env::var(key)
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn current_dir_impl(&self) -> Result<PathBuf> {
        env::current_dir().context("Failed to get current working directory")
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn create_temp_dir_impl(&self, prefix: Option<&str>) -> Result<PathBuf> {
        let mut builder = tempfile::Builder::new();
        let prefix = prefix.unwrap_or("sharepkg-");
        builder.prefix(prefix);
        let dir = builder
            .tempdir()
            .with_context(|| format!("Failed to create temporary directory with prefix {:?}", prefix))?;
        // Lifetime of the directory is managed by the install cleanup context.
        Ok(dir.keep())
    }
}
