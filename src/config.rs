//! User configuration.
//!
//! Loaded from an optional TOML file, layered under `GION_*` environment
//! variables:
//!
//! ```toml
//! root = "~/gion"
//! prefetch-timeout-secs = 120
//! max-concurrent-commands = 16
//! ```
//!
//! The file lives at `$GION_CONFIG`, or `<config dir>/gion/config.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::ConfigError;
use serde::{Deserialize, Serialize};

use crate::shell_exec::DEFAULT_CONCURRENT_COMMANDS;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GionConfig {
    /// Root directory holding `bare/`, `src/` and `workspaces/`.
    #[serde(default)]
    pub root: Option<PathBuf>,

    /// Upper bound for a single background fetch; 0 disables the bound.
    #[serde(
        default,
        rename = "prefetch-timeout-secs",
        alias = "prefetch_timeout_secs"
    )]
    pub prefetch_timeout_secs: u64,

    #[serde(
        default = "default_max_concurrent_commands",
        rename = "max-concurrent-commands",
        alias = "max_concurrent_commands"
    )]
    pub max_concurrent_commands: usize,
}

fn default_max_concurrent_commands() -> usize {
    DEFAULT_CONCURRENT_COMMANDS
}

impl Default for GionConfig {
    fn default() -> Self {
        Self {
            root: None,
            prefetch_timeout_secs: 0,
            max_concurrent_commands: DEFAULT_CONCURRENT_COMMANDS,
        }
    }
}

impl GionConfig {
    /// Load from the default location plus environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(config_path().as_deref())
    }

    /// Load from `path` (missing file is fine) plus environment.
    pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            log::debug!("loading config from {}", path.display());
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            );
        }
        builder
            .add_source(config::Environment::with_prefix("GION").try_parsing(true))
            .build()?
            .try_deserialize()
    }

    pub fn prefetch_timeout(&self) -> Option<Duration> {
        (self.prefetch_timeout_secs > 0).then(|| Duration::from_secs(self.prefetch_timeout_secs))
    }

    /// Root directory: explicit override, then config, then `~/gion`.
    pub fn resolve_root(&self, cli_root: Option<&Path>) -> Result<PathBuf, ConfigError> {
        if let Some(root) = cli_root.or(self.root.as_deref()) {
            return Ok(expand_home(root));
        }
        dirs::home_dir()
            .map(|home| home.join("gion"))
            .ok_or_else(|| ConfigError::Message("cannot determine home directory".into()))
    }
}

/// Config file location.
///
/// Priority:
/// 1. `GION_CONFIG` environment variable
/// 2. Platform-specific default location
pub fn config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("GION_CONFIG") {
        return Some(PathBuf::from(path));
    }

    use etcetera::base_strategy::{BaseStrategy, choose_base_strategy};
    let strategy = choose_base_strategy().ok()?;
    Some(strategy.config_dir().join("gion").join("config.toml"))
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}
