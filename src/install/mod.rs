//! Install stages.
//!
//! A package definition lists its `install-stages`; each entry names one of
//! the step kinds below through its `"type"` field. Steps run in order and
//! share an [`InstallContext`]: files a step produces become available to the
//! following ones by name (e.g. `dist-archive`, `modulefile`).

mod context;
mod cvmfs;
mod modulefile;
mod shell;
mod unpack;

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};

use crate::runtime::Runtime;

pub use context::InstallContext;
pub use cvmfs::OpenCvmfsTransaction;
pub use modulefile::{InstallModulefile, modulefile_dependencies};
pub use shell::ShellCmd;
pub use unpack::{InstallCpackPkg, UnpackDistArchive};

/// Package file name produced by a build step and consumed by `unpack-dist-archive`.
pub const DIST_ARCHIVE: &str = "dist-archive";
/// Package file name consumed by `install-cpack-pkg`.
pub const CPACK_ARCHIVE: &str = "cpack-archive";
/// Package file name consumed by `install-modulefile`.
pub const MODULEFILE: &str = "modulefile";
/// A text file listing extra installed paths, one per line.
pub const INSTALLED_FILES_LIST: &str = "installed-files-list";

pub trait InstallStep {
    fn name(&self) -> &'static str;

    fn execute<R: Runtime>(&self, ctx: &mut InstallContext<'_, R>) -> Result<()>;
}

/// One entry of `install-stages`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StepDescriptor {
    ShellCmd(ShellCmd),
    UnpackDistArchive(UnpackDistArchive),
    InstallCpackPkg(InstallCpackPkg),
    InstallModulefile(InstallModulefile),
    OpenCvmfsTransaction(OpenCvmfsTransaction),
}

impl StepDescriptor {
    pub fn name(&self) -> &'static str {
        match self {
            StepDescriptor::ShellCmd(step) => step.name(),
            StepDescriptor::UnpackDistArchive(step) => step.name(),
            StepDescriptor::InstallCpackPkg(step) => step.name(),
            StepDescriptor::InstallModulefile(step) => step.name(),
            StepDescriptor::OpenCvmfsTransaction(step) => step.name(),
        }
    }

    pub fn execute<R: Runtime>(&self, ctx: &mut InstallContext<'_, R>) -> Result<()> {
        match self {
            StepDescriptor::ShellCmd(step) => step.execute(ctx),
            StepDescriptor::UnpackDistArchive(step) => step.execute(ctx),
            StepDescriptor::InstallCpackPkg(step) => step.execute(ctx),
            StepDescriptor::InstallModulefile(step) => step.execute(ctx),
            StepDescriptor::OpenCvmfsTransaction(step) => step.execute(ctx),
        }
    }
}

/// Run `stages` in order, stopping at the first failure.
#[tracing::instrument(skip_all, fields(package = %ctx.package))]
pub fn run_stages<R: Runtime>(stages: &[StepDescriptor], ctx: &mut InstallContext<'_, R>) -> Result<()> {
    let total = stages.len();
    for (n, stage) in stages.iter().enumerate() {
        info!("Install stage {}/{}: {}", n + 1, total, stage.name());
        stage
            .execute(ctx)
            .with_context(|| format!("Install stage #{} ({}) failed", n + 1, stage.name()))?;
    }
    Ok(())
}
