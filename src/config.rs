use std::{
    env, fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Context as _;
use serde::Deserialize;

use crate::store::RetentionLimit;

pub const PROJECT_CONFIG_FILENAME: &str = "wiretap.toml";
const HOME_CONFIG_DIR: &str = ".wiretap";
const HOME_CONFIG_FILENAME: &str = "config.toml";
const DEFAULT_LISTEN: &str = "127.0.0.1:8080";
const DEFAULT_STORAGE_PATH: &str = ".wiretap";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    pub logging: Option<LoggingConfig>,
    #[serde(default)]
    pub taps: Vec<TapConfig>,
}

impl Config {
    /// Loads `path` when given, otherwise the first of `./wiretap.toml` and
    /// `$HOME/.wiretap/config.toml` that exists, otherwise built-in defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = path {
            return Self::from_path(path);
        }
        match discover_config_path()? {
            Some(path) => Self::from_path(path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml).with_context(|| format!("load config {}", path.display()))
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    pub fn tap_patterns(&self) -> Vec<String> {
        self.taps.iter().map(|tap| tap.path_regex.clone()).collect()
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).context("parse config TOML")
    }
}

fn discover_config_path() -> anyhow::Result<Option<PathBuf>> {
    let project_config = env::current_dir()
        .context("resolve current directory")?
        .join(PROJECT_CONFIG_FILENAME);
    if project_config.is_file() {
        return Ok(Some(project_config));
    }

    if let Some(home) = env::var_os("HOME") {
        let home_config = PathBuf::from(home)
            .join(HOME_CONFIG_DIR)
            .join(HOME_CONFIG_FILENAME);
        if home_config.is_file() {
            return Ok(Some(home_config));
        }
    }

    Ok(None)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Base URI that requests are forwarded to, e.g. `http://127.0.0.1:3000`.
    pub upstream: Option<String>,
    /// Capture only runs in debug mode.
    #[serde(default)]
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            upstream: None,
            debug: false,
        }
    }
}

fn default_listen() -> SocketAddr {
    DEFAULT_LISTEN
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 8080)))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from(DEFAULT_STORAGE_PATH)
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaptureConfig {
    #[serde(default)]
    pub max_messages: RetentionLimit,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TapConfig {
    #[serde(default)]
    pub path_regex: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
    /// Level for per-message capture events, independent of `level`.
    pub capture_level: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}
