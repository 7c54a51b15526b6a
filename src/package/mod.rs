//! Package management module
//!
//! This module provides abstractions for installed packages: identity,
//! version attributes and their ordering, install manifests and the
//! on-disk manifest registry.

mod discovery;
mod key;
mod manifest;
mod order;
mod registry;
mod version;

pub use discovery::find_all_manifests;
pub use key::PackageKey;
pub use manifest::{Manifest, Stats, format_size};
pub use order::{
    AttrRef, AttrSpec, Conversion, FlavourKey, INSTALL_TIME, OrderKey, Partition, VersionOrder, VersionRecord,
};
pub use registry::PackageRegistry;
pub use version::{AttrValue, FULL_VERSION, VersionAttributes, VersionError, VersionParser};
