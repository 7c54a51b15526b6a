//! Symlink creation.

use anyhow::{Context, Result};
use std::path::Path;

use super::RealRuntime;

impl RealRuntime {
    #[tracing::instrument(skip(self))]
    pub(crate) fn symlink_impl(&self, original: &Path, link: &Path) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::symlink as unix_symlink;
            unix_symlink(original, link)
                .with_context(|| format!("Failed to create symlink {:?} -> {:?}", link, original))?;
        }
        #[cfg(not(unix))]
        {
            anyhow::bail!(
                "Symlinks are not supported on this platform: {:?} -> {:?}",
                link,
                original
            );
        }
        Ok(())
    }
}
