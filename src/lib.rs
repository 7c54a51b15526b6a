pub mod application;
pub mod archive;
pub mod cleanup;
pub mod commands;
pub mod graph;
pub mod install;
pub mod package;
pub mod protection;
pub mod runtime;
pub mod settings;
