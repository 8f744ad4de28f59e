//! Executor configuration and its resolution chain.
//!
//! Grounded on the teacher's `jobstore::resolve_root` priority chain
//! (CLI flag → env var → platform default via the `directories` crate),
//! extended with an optional on-disk `pkgplan.toml` defaults file using
//! `toml`, the way a small CLI tool's ambient config layer typically reads
//! one without pulling in a full config-management framework.

use std::path::{Path, PathBuf};

use directories::BaseDirs;
use serde::Deserialize;

use crate::error::{ExecError, Result};

/// Resolved executor configuration (spec.md §6 Parameters).
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub lib: PathBuf,
    pub num_workers: usize,
}

impl ExecutorConfig {
    /// Validate inputs per spec.md §7 InvalidInput: `lib` must resolve to a
    /// real path-like string and `num_workers` must be at least 1.
    pub fn new(lib: PathBuf, num_workers: usize) -> Result<Self> {
        if num_workers < 1 {
            return Err(ExecError::InvalidInput(format!(
                "num_workers must be >= 1, got {num_workers}"
            )));
        }
        if lib.as_os_str().is_empty() {
            return Err(ExecError::InvalidInput("lib must not be empty".to_string()));
        }
        Ok(ExecutorConfig { lib, num_workers })
    }
}

/// On-disk defaults file, analogous to a project-level config a caller might
/// drop in their working directory. Entirely optional.
#[derive(Debug, Default, Deserialize)]
struct TomlDefaults {
    #[serde(default)]
    defaults: TomlDefaultsSection,
}

#[derive(Debug, Default, Deserialize)]
struct TomlDefaultsSection {
    lib: Option<String>,
    num_workers: Option<usize>,
}

fn read_toml_defaults(path: &Path) -> Option<TomlDefaultsSection> {
    let contents = std::fs::read_to_string(path).ok()?;
    let parsed: TomlDefaults = toml::from_str(&contents).ok()?;
    Some(parsed.defaults)
}

/// Resolve `lib`: CLI flag → `PKGPLAN_LIB` env var → `pkgplan.toml`
/// `[defaults] lib` → first entry of the platform library-path env var →
/// current directory.
pub fn resolve_lib(cli_lib: Option<&str>, config_file: Option<&Path>) -> PathBuf {
    if let Some(lib) = cli_lib {
        return PathBuf::from(lib);
    }
    if let Ok(lib) = std::env::var("PKGPLAN_LIB") {
        if !lib.is_empty() {
            return PathBuf::from(lib);
        }
    }
    if let Some(path) = config_file {
        if let Some(defaults) = read_toml_defaults(path) {
            if let Some(lib) = defaults.lib {
                return PathBuf::from(lib);
            }
        }
    }
    if let Ok(search_path) = std::env::var(library_search_path_var()) {
        if let Some(first) = std::env::split_paths(&search_path).next() {
            return first;
        }
    }
    if let Some(base_dirs) = BaseDirs::new() {
        return base_dirs.home_dir().join(".local").join("lib").join("R");
    }
    PathBuf::from(".")
}

/// Resolve `num_workers`: CLI flag → `pkgplan.toml` `[defaults] num_workers`
/// → a small default based on available parallelism.
pub fn resolve_num_workers(cli_num_workers: Option<usize>, config_file: Option<&Path>) -> usize {
    if let Some(n) = cli_num_workers {
        return n;
    }
    if let Some(path) = config_file {
        if let Some(defaults) = read_toml_defaults(path) {
            if let Some(n) = defaults.num_workers {
                return n;
            }
        }
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn library_search_path_var() -> &'static str {
    "R_LIBS"
}
