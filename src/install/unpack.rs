use anyhow::{Result, bail};
use log::info;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::archive::TarExtractor;
use crate::runtime::Runtime;

use super::{CPACK_ARCHIVE, DIST_ARCHIVE, InstallContext, InstallStep};

/// Unpack the `dist-archive` package file into `prefix`, dropping the
/// archive's top directory.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UnpackDistArchive {
    pub prefix: String,
}

impl InstallStep for UnpackDistArchive {
    fn name(&self) -> &'static str {
        "unpack-dist-archive"
    }

    #[tracing::instrument(skip_all, fields(prefix = %self.prefix))]
    fn execute<R: Runtime>(&self, ctx: &mut InstallContext<'_, R>) -> Result<()> {
        unpack_package_file(ctx, DIST_ARCHIVE, &self.prefix)
    }
}

/// Unpack the `cpack-archive` package file (a CPack `TGZ` bundle) into
/// `prefix`, the same way `unpack-dist-archive` does.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstallCpackPkg {
    pub prefix: String,
}

impl InstallStep for InstallCpackPkg {
    fn name(&self) -> &'static str {
        "install-cpack-pkg"
    }

    #[tracing::instrument(skip_all, fields(prefix = %self.prefix))]
    fn execute<R: Runtime>(&self, ctx: &mut InstallContext<'_, R>) -> Result<()> {
        unpack_package_file(ctx, CPACK_ARCHIVE, &self.prefix)
    }
}

fn unpack_package_file<R: Runtime>(ctx: &mut InstallContext<'_, R>, file_name: &str, prefix: &str) -> Result<()> {
    let archive = ctx.package_file(file_name)?.to_path_buf();
    if prefix.trim().is_empty() {
        bail!("Empty prefix, can't unpack {:?}", archive);
    }
    let prefix = PathBuf::from(ctx.format(prefix));

    let entries = TarExtractor.extract(ctx.runtime, &archive, &prefix)?;
    info!("{} entries of {:?} unpacked into {:?}", entries.len(), archive, prefix);
    ctx.record_all(entries);
    Ok(())
}
