use anyhow::{Context, Result, bail};
use log::info;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::runtime::Runtime;

use super::{InstallContext, InstallStep};

const CVMFS_SERVER: &str = "cvmfs_server";

fn default_timeout() -> Option<u64> {
    Some(60)
}

/// Open a transaction on a CVMFS repository.
///
/// The transaction is published once the installation succeeds and
/// aborted when it fails. `timeoutSec` is passed as `-t`; `null` leaves
/// the server default.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpenCvmfsTransaction {
    pub cvmfs_server: String,
    #[serde(default = "default_timeout")]
    pub timeout_sec: Option<u64>,
}

impl InstallStep for OpenCvmfsTransaction {
    fn name(&self) -> &'static str {
        "open-cvmfs-transaction"
    }

    #[tracing::instrument(skip_all, fields(server = %self.cvmfs_server))]
    fn execute<R: Runtime>(&self, ctx: &mut InstallContext<'_, R>) -> Result<()> {
        let server = ctx.format(&self.cvmfs_server);
        if server.trim().is_empty() {
            bail!("open-cvmfs-transaction stage needs a \"cvmfsServer\"");
        }
        let command = |args: &[&str]| -> Vec<String> {
            std::iter::once(CVMFS_SERVER)
                .chain(args.iter().copied())
                .map(str::to_string)
                .collect()
        };

        let mut cmd = command(&["transaction", server.as_str()]);
        if let Some(timeout) = self.timeout_sec {
            cmd.extend(["-t".to_string(), timeout.to_string()]);
        }
        let root = PathBuf::from("/");
        ctx.runtime
            .run_command(&cmd, &root, &[])
            .with_context(|| format!("Failed to open CVMFS transaction on {}", server))?;
        info!("CVMFS transaction opened on {}", server);

        ctx.cleanup_mut().add_commands(
            command(&["publish", server.as_str()]),
            command(&["abort", "-f", server.as_str()]),
            root,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::{PackageRegistry, VersionAttributes};
    use crate::runtime::MockRuntime;
    use crate::settings::Settings;
    use anyhow::anyhow;
    use mockall::Sequence;
    use std::path::Path;

    fn step(timeout_sec: Option<u64>) -> OpenCvmfsTransaction {
        OpenCvmfsTransaction {
            cvmfs_server: "{repo}".into(),
            timeout_sec,
        }
    }

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.definitions.insert("repo".into(), "sw.example.org".into());
        settings
    }

    fn expect(runtime: &mut MockRuntime, seq: &mut Sequence, args: &'static [&'static str]) {
        runtime
            .expect_run_command()
            .withf(move |cmd, cwd, _| cmd[0] == CVMFS_SERVER && cmd[1..] == *args && cwd == Path::new("/"))
            .times(1)
            .in_sequence(seq)
            .returning(|_, _, _| Ok(String::new()));
    }

    #[test]
    fn test_transaction_published_on_success() {
        let mut runtime = MockRuntime::new();
        let mut seq = Sequence::new();
        expect(&mut runtime, &mut seq, &["transaction", "sw.example.org", "-t", "60"]);
        expect(&mut runtime, &mut seq, &["publish", "sw.example.org"]);

        let settings = settings();
        let registry = PackageRegistry::new(&runtime, PathBuf::from("/registry"));
        let mut ctx = InstallContext::new(&runtime, &registry, &settings, "xz", VersionAttributes::new("5.6")).unwrap();
        step(default_timeout()).execute(&mut ctx).unwrap();
        ctx.finish(false);
    }

    #[test]
    fn test_transaction_aborted_on_failure() {
        let mut runtime = MockRuntime::new();
        let mut seq = Sequence::new();
        expect(&mut runtime, &mut seq, &["transaction", "sw.example.org"]);
        expect(&mut runtime, &mut seq, &["abort", "-f", "sw.example.org"]);

        let settings = settings();
        let registry = PackageRegistry::new(&runtime, PathBuf::from("/registry"));
        let mut ctx = InstallContext::new(&runtime, &registry, &settings, "xz", VersionAttributes::new("5.6")).unwrap();
        step(None).execute(&mut ctx).unwrap();
        ctx.finish(true);
    }

    #[test]
    fn test_failed_open_registers_nothing() {
        let mut runtime = MockRuntime::new();
        runtime
            .expect_run_command()
            .times(1)
            .returning(|_, _, _| Err(anyhow!("repository is already in a transaction")));

        let settings = settings();
        let registry = PackageRegistry::new(&runtime, PathBuf::from("/registry"));
        let mut ctx = InstallContext::new(&runtime, &registry, &settings, "xz", VersionAttributes::new("5.6")).unwrap();
        let err = step(Some(5)).execute(&mut ctx).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to open CVMFS transaction on sw.example.org"));

        // A second run_command call would exceed times(1).
        ctx.finish(true);
    }

    #[test]
    fn test_timeout_defaults_and_null() {
        let parsed: OpenCvmfsTransaction = serde_json::from_str(r#"{"cvmfsServer": "sw"}"#).unwrap();
        assert_eq!(parsed.timeout_sec, Some(60));
        let parsed: OpenCvmfsTransaction = serde_json::from_str(r#"{"cvmfsServer": "sw", "timeoutSec": null}"#).unwrap();
        assert_eq!(parsed.timeout_sec, None);
    }
}
