use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::Cli;

pub const CONFIG_FILE_NAME: &str = "kiln.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub packages: PackagesConfig,
    #[serde(default)]
    pub toolchain: ToolchainConfig,
    #[serde(default)]
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub build_timeout_ms: Option<u64>,
    #[serde(default = "default_run_timeout_ms")]
    pub run_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackagesConfig {
    #[serde(default = "default_packages_root")]
    pub root: String,
    #[serde(default = "default_descriptor")]
    pub descriptor: String,
    #[serde(default = "default_script_package")]
    pub script_package: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolchainConfig {
    #[serde(default = "default_compile_command")]
    pub compile: Vec<String>,
    #[serde(default = "default_run_command")]
    pub run: Vec<String>,
    #[serde(default = "default_source_extensions")]
    pub source_extensions: Vec<String>,
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: String,
    #[serde(default = "default_artifact_name")]
    pub artifact_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_max_runs")]
    pub max_runs: usize,
    #[serde(default = "default_storage_path")]
    pub storage_path: String,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            build_timeout_ms: None,
            run_timeout_ms: default_run_timeout_ms(),
        }
    }
}

impl Default for PackagesConfig {
    fn default() -> Self {
        Self {
            root: default_packages_root(),
            descriptor: default_descriptor(),
            script_package: default_script_package(),
        }
    }
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            compile: default_compile_command(),
            run: default_run_command(),
            source_extensions: default_source_extensions(),
            artifact_dir: default_artifact_dir(),
            artifact_name: default_artifact_name(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_runs: default_max_runs(),
            storage_path: default_storage_path(),
        }
    }
}

impl BudgetConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn build_timeout(&self) -> Option<Duration> {
        self.build_timeout_ms.map(Duration::from_millis)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_run_timeout_ms() -> u64 {
    10_000
}

fn default_packages_root() -> String {
    "~/.kiln/packages".to_string()
}

fn default_descriptor() -> String {
    "project.toml".to_string()
}

fn default_script_package() -> String {
    "script".to_string()
}

fn default_compile_command() -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        "cat {sources} > {artifact}".to_string(),
    ]
}

fn default_run_command() -> Vec<String> {
    vec!["sh".to_string(), "{artifact}".to_string()]
}

fn default_source_extensions() -> Vec<String> {
    vec!["sh".to_string()]
}

fn default_artifact_dir() -> String {
    "build".to_string()
}

fn default_artifact_name() -> String {
    "app".to_string()
}

fn default_max_runs() -> usize {
    50
}

fn default_storage_path() -> String {
    "~/.kiln/run_history.json".to_string()
}

impl Config {
    /// Loads `--config`, or `kiln.toml` in the source directory, and fills
    /// sections it leaves out from the global config.
    pub fn load_from_cli(cli: &Cli) -> anyhow::Result<Self> {
        let path = cli
            .config
            .clone()
            .unwrap_or_else(|| cli.source_directory().join(CONFIG_FILE_NAME));

        let local = Config::load_partial(&path)?;
        let global = Config::load_partial(&Config::global_path())?;

        Ok(local.merge_with(global))
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        Ok(Self::load_partial(path.as_ref())?.merge_with(PartialConfig::default()))
    }

    fn load_partial(path: &Path) -> anyhow::Result<PartialConfig> {
        let path = Self::expand_path(&path.display().to_string());

        if !path.exists() {
            return Ok(PartialConfig::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: PartialConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    pub fn global_path() -> PathBuf {
        Self::expand_path("~/.config/kiln/kiln.toml")
    }

    pub fn expand_path(path: &str) -> PathBuf {
        let expanded = shellexpand::tilde(path);
        PathBuf::from(expanded.as_ref())
    }

    pub fn packages_root(&self) -> PathBuf {
        Self::expand_path(&self.packages.root)
    }

    pub fn storage_path(&self) -> PathBuf {
        Self::expand_path(&self.history.storage_path)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }
}

/// A config file as written, with whole sections optional so a local file can
/// defer individual sections to the global one.
#[derive(Debug, Clone, Default, Deserialize)]
struct PartialConfig {
    budget: Option<BudgetConfig>,
    packages: Option<PackagesConfig>,
    toolchain: Option<ToolchainConfig>,
    history: Option<HistoryConfig>,
}

impl PartialConfig {
    fn merge_with(self, fallback: PartialConfig) -> Config {
        Config {
            budget: self.budget.or(fallback.budget).unwrap_or_default(),
            packages: self.packages.or(fallback.packages).unwrap_or_default(),
            toolchain: self.toolchain.or(fallback.toolchain).unwrap_or_default(),
            history: self.history.or(fallback.history).unwrap_or_default(),
        }
    }
}
