use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::runtime::Runtime;

/// Find all manifest candidates in a registry.
///
/// Directory structure: `<root>/<name>/<version>.json`. Files directly under
/// the root (such as the graph cache) are not candidates.
#[tracing::instrument(skip(runtime, root))]
pub fn find_all_manifests<R: Runtime>(runtime: &R, root: &Path) -> Result<Vec<PathBuf>> {
    let mut manifests = Vec::new();

    if !runtime.exists(root) {
        return Ok(manifests);
    }

    for package_dir in runtime.read_dir(root)? {
        if !runtime.is_dir(&package_dir) {
            continue;
        }
        for entry in runtime.read_dir(&package_dir)? {
            if entry.extension().is_some_and(|ext| ext == "json") && runtime.is_file(&entry) {
                manifests.push(entry);
            }
        }
    }

    manifests.sort();
    Ok(manifests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockRuntime;
    use mockall::predicate::eq;

    #[test]
    fn test_find_all_manifests() {
        let mut runtime = MockRuntime::new();
        let root = PathBuf::from("/registry");

        runtime.expect_exists().with(eq(root.clone())).returning(|_| true);

        runtime
            .expect_read_dir()
            .with(eq(root.clone()))
            .returning(|p| Ok(vec![p.join("xz"), p.join("root"), p.join("deps.graph.json")]));

        runtime
            .expect_is_dir()
            .returning(|p| !p.to_string_lossy().ends_with(".json"));

        runtime
            .expect_read_dir()
            .with(eq(root.join("xz")))
            .returning(|p| Ok(vec![p.join("5.6.2.json"), p.join("notes.txt")]));
        runtime
            .expect_read_dir()
            .with(eq(root.join("root")))
            .returning(|p| Ok(vec![p.join("6.30.json"), p.join("6.28.json")]));

        runtime.expect_is_file().returning(|_| true);

        let found = find_all_manifests(&runtime, &root).unwrap();

        assert_eq!(
            found,
            vec![
                PathBuf::from("/registry/root/6.28.json"),
                PathBuf::from("/registry/root/6.30.json"),
                PathBuf::from("/registry/xz/5.6.2.json"),
            ]
        );
    }

    #[test]
    fn test_find_all_manifests_missing_root() {
        let mut runtime = MockRuntime::new();
        runtime.expect_exists().returning(|_| false);

        let found = find_all_manifests(&runtime, Path::new("/registry")).unwrap();
        assert!(found.is_empty());
    }
}
