//! Command-line interface parsing for modver
//!
//! This module handles parsing of CLI arguments using clap. Environment
//! variables are folded into arguments here so the library never reads them.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::config::{ConfigError, Settings};
use crate::version::{parse_version, DEFAULT_REGISTRY_URL};

/// Error types for CLI argument parsing
#[derive(Debug, Error)]
pub enum CliError {
    /// The given version is not valid semver
    #[error("Invalid version: '{0}'. Expected a semantic version such as 1.2.3")]
    InvalidVersion(String),
}

/// modver - check for module updates with a disk-backed cache
#[derive(Parser, Debug)]
#[command(name = "modver")]
#[command(about = "Module update checks backed by a TTL disk cache")]
#[command(version)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check whether a newer version of a module has been published
    ///
    /// Examples:
    ///   modver check expo-cli --current 6.0.0
    ///   modver check @expo/cli --current 0.10.1 --timeout-ms 2000
    Check {
        /// Module name as published in the registry
        module: String,

        /// Locally installed version
        #[arg(long, value_parser = parse_version_arg)]
        current: String,

        /// Registry base URL
        #[arg(long, env = "MODVER_REGISTRY_URL", default_value = DEFAULT_REGISTRY_URL)]
        registry: String,

        /// Give up on the registry after this many milliseconds
        #[arg(long, value_name = "MS", default_value_t = 10_000)]
        timeout_ms: u64,

        #[command(flatten)]
        cache: CacheArgs,
    },

    /// Print the cache file used for a module's update check
    CachePath {
        /// Module name as published in the registry
        module: String,

        #[command(flatten)]
        cache: CacheArgs,
    },
}

/// Cache location shared by all commands
#[derive(Args, Debug, Clone, Default)]
pub struct CacheArgs {
    /// Directory for cache files (defaults to the XDG cache directory)
    #[arg(long, env = "MODVER_CACHE_DIR", value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,
}

/// Validates a `--current` argument
///
/// # Returns
/// * `Ok(String)` with the trimmed version
/// * `Err(CliError::InvalidVersion)` if it is not semver
pub fn parse_version_arg(s: &str) -> Result<String, CliError> {
    parse_version(s)
        .map(|_| s.trim().to_string())
        .map_err(|_| CliError::InvalidVersion(s.to_string()))
}

impl Command {
    /// Builds runtime settings from the parsed arguments
    pub fn settings(&self) -> Result<Settings, ConfigError> {
        match self {
            Command::Check {
                registry,
                timeout_ms,
                cache,
                ..
            } => Ok(Settings::resolve(cache.cache_dir.clone())?
                .with_registry_url(registry.clone())
                .with_fetch_timeout(Duration::from_millis(*timeout_ms))),
            Command::CachePath { cache, .. } => Settings::resolve(cache.cache_dir.clone()),
        }
    }
}
