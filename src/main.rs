use clap::Parser;
use log::error;
use sharepkg::commands::config::Config;
use sharepkg::settings::{DEFAULT_SETTINGS_FILE, SETTINGS_ENV};
use std::path::PathBuf;
use std::process::ExitCode;

/// sharepkg - shared software package manager
///
/// Installs package versions through the stages configured in the settings
/// file, keeps a manifest per installed version, and removes packages in
/// dependency order while honouring protection rules.
///
/// Examples:
///   sharepkg install root 6.30 -u xz/5.6   # Install root 6.30 built against xz 5.6
///   sharepkg remove xz '5.*'               # Remove every xz 5.x not needed elsewhere
///   sharepkg remove @unprotected -y        # Remove everything no rule protects
///   sharepkg show --tree                   # Print the dependency graph
#[derive(Parser, Debug)]
#[command(author, version = env!("SHAREPKG_VERSION"), about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (also via SHAREPKG_SETTINGS)
    #[arg(
        long = "settings",
        short = 'c',
        env = SETTINGS_ENV,
        value_name = "FILE",
        default_value = DEFAULT_SETTINGS_FILE,
        global = true
    )]
    pub settings: PathBuf,

    /// Override a definition of the settings file
    #[arg(long = "define", short = 'D', value_name = "KEY=VALUE", global = true)]
    pub defines: Vec<String>,

    /// Rebuild the dependency graph cache from the manifests
    #[arg(long = "dep-recache", global = true)]
    pub dep_recache: bool,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Install a package version
    #[command(visible_alias = "add")]
    Install(InstallArgs),

    /// Remove installed packages
    #[command(visible_aliases = ["delete", "uninstall", "rm"])]
    Remove(RemoveArgs),

    /// Show installed packages
    #[command(visible_aliases = ["inspect", "list"])]
    Show(ShowArgs),
}

#[derive(clap::Args, Debug)]
pub struct InstallArgs {
    /// Package name as configured in the settings file
    pub name: String,

    /// Version string to install
    pub version: String,

    /// Installed package to use as a dependency
    #[arg(long = "use", short = 'u', value_name = "NAME/VERSION")]
    pub uses: Vec<String>,

    /// Script exported to install stages as SHAREPKG_MODULESCRIPT
    #[arg(long = "module-script", value_name = "FILE")]
    pub modulescript: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
pub struct RemoveArgs {
    /// Package name or glob, or @unprotected for every unprotected package
    #[arg(value_name = "NAME")]
    pub name: String,

    /// Version glob (defaults to every version)
    #[arg(value_name = "VERSION")]
    pub version: Option<String>,

    /// Skip the confirmation prompt
    #[arg(long, short)]
    pub yes: bool,

    /// Protect matching packages for this invocation
    #[arg(long, short, value_name = "NAME/VERSION")]
    pub keep: Vec<String>,
}

#[derive(clap::Args, Debug)]
pub struct ShowArgs {
    /// Package name or glob
    pub name: Option<String>,

    /// Version; with a name, shows that package's details
    pub version: Option<String>,

    /// Print the dependency graph instead
    #[arg(long)]
    pub tree: bool,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let runtime = sharepkg::runtime::RealRuntime;
    let config = Config {
        settings_file: cli.settings,
        defines: cli.defines,
        dep_recache: cli.dep_recache,
    };

    let result = match cli.command {
        Commands::Install(args) => sharepkg::commands::install(
            runtime,
            &args.name,
            &args.version,
            &args.uses,
            args.modulescript,
            config,
        ),
        Commands::Remove(args) => sharepkg::commands::remove(
            runtime,
            &args.name,
            args.version.as_deref(),
            args.yes,
            &args.keep,
            config,
        ),
        Commands::Show(args) => {
            sharepkg::commands::show(runtime, args.name.as_deref(), args.version.as_deref(), args.tree, config)
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
