//! Runtime abstraction for system operations.
//!
//! This module provides a trait-based abstraction over system operations,
//! enabling dependency injection and testability.
//!
//! # Structure
//!
//! - `env` - Environment variables and working/temporary directories
//! - `fs` - File system operations (read, write, directory, links, globbing)
//! - `process` - Subprocess execution for install steps
//! - `symlink` - Symlink creation
//! - `user` - User interaction (confirmation prompts, TTY detection)

mod env;
mod fs;
mod process;
mod symlink;
mod user;

use anyhow::Result;
use std::env as std_env;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[cfg_attr(test, mockall::automock)]
pub trait Runtime: Send + Sync {
    // Environment
    fn env_var(&self, key: &str) -> Result<String, std_env::VarError>;
    fn current_dir(&self) -> Result<PathBuf>;

    // File System
    fn write(&self, path: &Path, contents: &[u8]) -> Result<()>;
    fn read_to_string(&self, path: &Path) -> Result<String>;
    fn copy(&self, from: &Path, to: &Path) -> Result<u64>;
    fn create_dir_all(&self, path: &Path) -> Result<()>;
    fn remove_file(&self, path: &Path) -> Result<()>;
    fn remove_dir(&self, path: &Path) -> Result<()>;
    fn remove_symlink(&self, path: &Path) -> Result<()>;
    fn symlink(&self, original: &Path, link: &Path) -> Result<()>;
    fn exists(&self, path: &Path) -> bool;
    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>>;
    fn is_symlink(&self, path: &Path) -> bool;
    fn is_file(&self, path: &Path) -> bool;
    fn create_file(&self, path: &Path) -> Result<Box<dyn std::io::Write + Send>>;
    fn open(&self, path: &Path) -> Result<Box<dyn std::io::Read + Send>>;
    fn remove_dir_all(&self, path: &Path) -> Result<()>;
    fn is_dir(&self, path: &Path) -> bool;

    /// Size in bytes of a regular file (symlinks are not followed).
    fn file_size(&self, path: &Path) -> Result<u64>;

    /// Last modification time of a file.
    fn modified(&self, path: &Path) -> Result<SystemTime>;

    /// Set file permissions (mode) on Unix systems. No-op elsewhere.
    fn set_permissions(&self, path: &Path, mode: u32) -> Result<()>;

    /// Expand a shell-style wildcard into the matching existing paths.
    fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>>;

    /// Create a fresh temporary directory, optionally named with `prefix`.
    fn create_temp_dir<'a>(&self, prefix: Option<&'a str>) -> Result<PathBuf>;

    // Processes
    /// Run a command to completion, returning combined stdout and stderr.
    /// A non-zero exit status is an error carrying the command output.
    fn run_command(&self, cmd: &[String], cwd: &Path, env: &[(String, String)]) -> Result<String>;

    // User interaction
    /// Whether stdin is attached to a terminal.
    fn is_interactive(&self) -> bool;

    /// Prompt user for confirmation. Returns true if user confirms (y/yes), false otherwise.
    fn confirm(&self, prompt: &str) -> Result<bool>;
}

pub struct RealRuntime;

impl Runtime for RealRuntime {
    fn env_var(&self, key: &str) -> Result<String, std_env::VarError> {
        self.env_var_impl(key)
    }

    fn current_dir(&self) -> Result<PathBuf> {
        self.current_dir_impl()
    }

    fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        self.write_impl(path, contents)
    }

    fn read_to_string(&self, path: &Path) -> Result<String> {
        self.read_to_string_impl(path)
    }

    fn copy(&self, from: &Path, to: &Path) -> Result<u64> {
        self.copy_impl(from, to)
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        self.create_dir_all_impl(path)
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        self.remove_file_impl(path)
    }

    fn remove_dir(&self, path: &Path) -> Result<()> {
        self.remove_dir_impl(path)
    }

    fn remove_symlink(&self, path: &Path) -> Result<()> {
        self.remove_symlink_impl(path)
    }

    fn symlink(&self, original: &Path, link: &Path) -> Result<()> {
        self.symlink_impl(original, link)
    }

    fn exists(&self, path: &Path) -> bool {
        self.exists_impl(path)
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        self.read_dir_impl(path)
    }

    fn is_symlink(&self, path: &Path) -> bool {
        self.is_symlink_impl(path)
    }

    fn is_file(&self, path: &Path) -> bool {
        self.is_file_impl(path)
    }

    fn create_file(&self, path: &Path) -> Result<Box<dyn std::io::Write + Send>> {
        self.create_file_impl(path)
    }

    fn open(&self, path: &Path) -> Result<Box<dyn std::io::Read + Send>> {
        self.open_impl(path)
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        self.remove_dir_all_impl(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.is_dir_impl(path)
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        self.file_size_impl(path)
    }

    fn modified(&self, path: &Path) -> Result<SystemTime> {
        self.modified_impl(path)
    }

    fn set_permissions(&self, path: &Path, mode: u32) -> Result<()> {
        self.set_permissions_impl(path, mode)
    }

    fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>> {
        self.glob_impl(pattern)
    }

    fn create_temp_dir<'a>(&self, prefix: Option<&'a str>) -> Result<PathBuf> {
        self.create_temp_dir_impl(prefix)
    }

    fn run_command(&self, cmd: &[String], cwd: &Path, env: &[(String, String)]) -> Result<String> {
        self.run_command_impl(cmd, cwd, env)
    }

    fn is_interactive(&self) -> bool {
        self.is_interactive_impl()
    }

    fn confirm(&self, prompt: &str) -> Result<bool> {
        self.confirm_impl(prompt)
    }
}
