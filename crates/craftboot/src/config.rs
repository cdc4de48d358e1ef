use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

pub const CONFIG_SCHEMA_VERSION: &str = "craftboot.config@0.1.0";

/// Preference order used by `which` when the requested runtime is absent,
/// newest first.
pub const DEFAULT_FALLBACK_ORDER: &[&str] = &["21", "17", "16", "11", "8"];

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub schema_version: String,
    #[serde(default)]
    pub provision: Provision,
    #[serde(default)]
    pub runtimes: Vec<RuntimeSpec>,
    #[serde(default)]
    pub search_dir: Option<PathBuf>,
    #[serde(default)]
    pub fallback_order: Vec<String>,
    #[serde(default)]
    pub server: ServerConfig,
}

/// How runtimes get onto disk: downloaded by the installer, or located among
/// runtimes the surrounding environment already installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provision {
    #[default]
    Download,
    Preinstalled,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeSpec {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_keepalive_secs() -> u64 {
    5
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            program: "gunicorn".to_string(),
            args: Vec::new(),
            timeout_secs: default_timeout_secs(),
            keepalive_secs: default_keepalive_secs(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Ok(Self {
                schema_version: CONFIG_SCHEMA_VERSION.to_string(),
                provision: Provision::Download,
                runtimes: Vec::new(),
                search_dir: None,
                fallback_order: Vec::new(),
                server: ServerConfig::default(),
            });
        }
        let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: Self =
            serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))?;
        if cfg.schema_version != CONFIG_SCHEMA_VERSION {
            bail!(
                "unsupported config schema_version: {} (expected {CONFIG_SCHEMA_VERSION})",
                cfg.schema_version
            );
        }
        for spec in &cfg.runtimes {
            validate_runtime_id(&spec.id)?;
        }
        Ok(cfg)
    }

    pub fn fallback_order(&self) -> Vec<String> {
        if self.fallback_order.is_empty() {
            return DEFAULT_FALLBACK_ORDER.iter().map(|s| s.to_string()).collect();
        }
        self.fallback_order.clone()
    }
}

pub fn validate_runtime_id(id: &str) -> Result<()> {
    if id.is_empty() {
        bail!("runtime id must be non-empty");
    }
    if id.contains('/') || id.contains('\\') {
        bail!("invalid runtime id: contains path separators");
    }
    if id.contains("..") {
        bail!("invalid runtime id: contains '..'");
    }
    Ok(())
}
