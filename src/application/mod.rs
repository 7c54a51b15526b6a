//! Application layer - Use cases that coordinate the registry, the
//! dependency graph and the protection rules.
//!
//! Commands build the actions below from the loaded settings and print
//! what they return.

mod install;
mod remove;
mod show;

pub use install::{InstallAction, InstallRequest};
pub use remove::{ConflictReport, GC_TOKEN, RemovalPlanner, RemovalRequest, RemovalSummary, RemoveAction};
pub use show::{ShowAction, dependency_tree};
