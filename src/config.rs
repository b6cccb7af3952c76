//! Configuration for meetloop, read from `.meetloop/meetloop.toml`.
//!
//! Layering is file → environment → CLI:
//!
//! ```toml
//! [server]
//! base_url = "http://localhost:3000"
//! connect_timeout_secs = 10
//!
//! [dispatch]
//! default_executor = "local"
//! title_match_len = 40
//!
//! [verify]
//! synthetic_id_base = 9000
//! requirement_match_len = 40
//!
//! [logging]
//! level = "info"
//! json = false
//! ```
//!
//! Environment overrides: `MEETLOOP_BASE_URL`, `MEETLOOP_DEFAULT_EXECUTOR`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::models::Lane;

pub const CONFIG_DIR: &str = ".meetloop";
pub const CONFIG_FILE: &str = "meetloop.toml";
pub const ENV_BASE_URL: &str = "MEETLOOP_BASE_URL";
pub const ENV_DEFAULT_EXECUTOR: &str = "MEETLOOP_DEFAULT_EXECUTOR";

/// Lowest id handed to gap items synthesized from failed validations.
/// Analyze ids are `requirement index + 1`, so this must stay clear of them.
pub const MIN_SYNTHETIC_ID_BASE: u32 = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Executor a gap gets until one is picked for it.
    #[serde(default)]
    pub default_executor: Lane,
    /// Leading requirement characters an issue title must contain to match.
    #[serde(default = "default_match_len")]
    pub title_match_len: usize,
}

fn default_match_len() -> usize {
    40
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_executor: Lane::default(),
            title_match_len: default_match_len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyConfig {
    #[serde(default = "default_synthetic_id_base")]
    pub synthetic_id_base: u32,
    /// Leading characters compared when matching validation results to rows.
    #[serde(default = "default_match_len")]
    pub requirement_match_len: usize,
}

fn default_synthetic_id_base() -> u32 {
    9000
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            synthetic_id_base: default_synthetic_id_base(),
            requirement_match_len: default_match_len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Contents of `meetloop.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PanelToml {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub verify: VerifyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PanelToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse meetloop.toml")
    }

    /// Load `<config_dir>/meetloop.toml`, or defaults if it does not exist.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize meetloop.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_BASE_URL).filter(|v| !v.trim().is_empty()) {
            self.server.base_url = url;
        }
        if let Some(executor) = lookup(ENV_DEFAULT_EXECUTOR).filter(|v| !v.trim().is_empty()) {
            self.dispatch.default_executor = executor
                .trim()
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .with_context(|| format!("Invalid {}", ENV_DEFAULT_EXECUTOR))?;
        }
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        let base_url = self.server.base_url.trim();
        if base_url.is_empty() {
            warnings.push("server.base_url is empty".to_string());
        } else if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            warnings.push(format!(
                "server.base_url '{}' should start with http:// or https://",
                base_url
            ));
        }
        if self.server.connect_timeout_secs == 0 {
            warnings.push("server.connect_timeout_secs is 0; connections will fail immediately".to_string());
        }
        if self.dispatch.title_match_len == 0 {
            warnings.push("dispatch.title_match_len is 0; every issue title would match".to_string());
        }
        if self.verify.requirement_match_len == 0 {
            warnings.push("verify.requirement_match_len is 0; only exact matches will be used".to_string());
        }
        if self.verify.synthetic_id_base < MIN_SYNTHETIC_ID_BASE {
            warnings.push(format!(
                "verify.synthetic_id_base {} is below {}; synthetic ids may collide with requirement ids",
                self.verify.synthetic_id_base, MIN_SYNTHETIC_ID_BASE
            ));
        }
        if self
            .logging
            .level
            .parse::<tracing_subscriber::filter::EnvFilter>()
            .is_err()
        {
            warnings.push(format!("logging.level '{}' is not a valid filter", self.logging.level));
        }

        warnings
    }
}

/// Effective configuration: `meetloop.toml` plus environment and CLI overrides.
#[derive(Debug, Clone)]
pub struct PanelConfig {
    pub project_dir: PathBuf,
    pub config_dir: PathBuf,
    pub toml: PanelToml,
    pub verbose: bool,
}

impl PanelConfig {
    /// Load configuration for `project_dir` (file → environment).
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let config_dir = project_dir.join(CONFIG_DIR);
        let mut toml = PanelToml::load_or_default(&config_dir)?;
        toml.apply_env_with(|key| std::env::var(key).ok())?;

        Ok(Self {
            project_dir,
            config_dir,
            toml,
            verbose: false,
        })
    }

    /// Load configuration and apply CLI overrides on top.
    pub fn with_cli_args(
        project_dir: PathBuf,
        verbose: bool,
        base_url: Option<String>,
        executor: Option<Lane>,
    ) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        if let Some(url) = base_url {
            config.toml.server.base_url = url;
        }
        if let Some(lane) = executor {
            config.toml.dispatch.default_executor = lane;
        }
        Ok(config)
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    pub fn server(&self) -> &ServerConfig {
        &self.toml.server
    }

    pub fn default_executor(&self) -> Lane {
        self.toml.dispatch.default_executor
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
