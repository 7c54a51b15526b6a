pub mod config;
mod install;
mod remove;
mod show;

pub use install::install;
pub use remove::remove;
pub use show::show;
