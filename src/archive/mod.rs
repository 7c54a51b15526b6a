//! Distribution archive unpacking.

use anyhow::{Context, Result, anyhow};
use flate2::read::GzDecoder;
use log::{debug, warn};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tar::Archive;

use crate::runtime::Runtime;

/// Extractor for `.tar`, `.tar.gz` and `.tgz` archives.
///
/// The first path component of every entry is stripped, so an archive
/// holding `pkg-1.0/bin/tool` unpacks to `<dest>/bin/tool`.
pub struct TarExtractor;

impl TarExtractor {
    pub fn can_handle(&self, archive_path: &Path) -> bool {
        let name = archive_path.to_string_lossy().to_lowercase();
        name.ends_with(".tar") || name.ends_with(".tar.gz") || name.ends_with(".tgz")
    }

    fn is_compressed(archive_path: &Path) -> bool {
        let name = archive_path.to_string_lossy().to_lowercase();
        name.ends_with(".gz") || name.ends_with(".tgz")
    }

    /// Unpack into `extract_to`, returning every created entry in archive order.
    #[tracing::instrument(skip(self, runtime))]
    pub fn extract<R: Runtime>(&self, runtime: &R, archive_path: &Path, extract_to: &Path) -> Result<Vec<PathBuf>> {
        if !self.can_handle(archive_path) {
            return Err(anyhow!("Unsupported archive format: {}", archive_path.display()));
        }
        debug!("Extracting {:?} to {:?}", archive_path, extract_to);

        let file = runtime
            .open(archive_path)
            .with_context(|| format!("Failed to open archive at {:?}", archive_path))?;
        let reader: Box<dyn Read> = if Self::is_compressed(archive_path) {
            Box::new(GzDecoder::new(file))
        } else {
            file
        };
        let mut archive = Archive::new(reader);

        runtime.create_dir_all(extract_to)?;
        let mut created = Vec::new();
        for entry in archive
            .entries()
            .with_context(|| format!("Failed to read archive {:?}", archive_path))?
        {
            let mut entry = entry.with_context(|| format!("Corrupt entry in archive {:?}", archive_path))?;
            let path = entry.path()?.into_owned();
            let Some(relative) = strip_first_component(&path) else {
                continue;
            };
            let dest = extract_to.join(&relative);
            let kind = entry.header().entry_type();

            if kind.is_dir() {
                runtime.create_dir_all(&dest)?;
            } else if kind.is_symlink() {
                let target = entry
                    .link_name()?
                    .ok_or_else(|| anyhow!("Symlink {:?} without a target", path))?
                    .into_owned();
                ensure_parent(runtime, &dest)?;
                if runtime.is_symlink(&dest) {
                    runtime.remove_symlink(&dest)?;
                }
                runtime.symlink(&target, &dest)?;
            } else if kind.is_file() {
                ensure_parent(runtime, &dest)?;
                let mut out = runtime.create_file(&dest)?;
                std::io::copy(&mut entry, &mut out).with_context(|| format!("Failed to extract file {:?}", dest))?;
                drop(out);

                #[cfg(unix)]
                if let Ok(mode) = entry.header().mode()
                    && let Err(e) = runtime.set_permissions(&dest, mode)
                {
                    debug!("Failed to set permissions on {:?}: {}", dest, e);
                }
            } else {
                warn!("Unsupported entry type {:?} of {:?} skipped", kind, path);
                continue;
            }
            created.push(dest);
        }

        debug!("Extracted {} entries", created.len());
        Ok(created)
    }
}

fn ensure_parent<R: Runtime>(runtime: &R, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !runtime.exists(parent)
    {
        runtime.create_dir_all(parent)?;
    }
    Ok(())
}

/// Drop the leading component. `None` for the top directory itself and for
/// paths escaping the destination.
fn strip_first_component(path: &Path) -> Option<PathBuf> {
    let mut components = path.components().filter(|c| !matches!(c, Component::CurDir));
    components.next()?;
    let mut stripped = PathBuf::new();
    for component in components {
        match component {
            Component::Normal(part) => stripped.push(part),
            _ => {
                warn!("Archive entry {:?} escapes the destination, skipped", path);
                return None;
            }
        }
    }
    if stripped.as_os_str().is_empty() { None } else { Some(stripped) }
}
