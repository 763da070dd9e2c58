//! Daemon configuration: `config.json` plus environment overrides.

use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use chainwatch_observer::ObserverConfig;

fn default_metrics_port() -> u16 {
    9090
}

/// Top-level configuration. Database credentials come from the file and
/// may be overridden by `DB_HOST`, `DB_PORT`, `DB_USER`, `DB_PASSWORD`
/// and `DB_NAME`; an override that fails to parse aborts startup.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub db_host: String,
    pub db_port: u16,
    pub db_user: String,
    pub db_password: String,
    pub db_name: String,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default)]
    pub observer: ObserverConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let mut cfg: Config = serde_json::from_str(&data).context("parsing config file")?;
        cfg.apply_env_overrides()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(value) = env::var("DB_HOST") {
            if !value.is_empty() {
                self.db_host = value;
            }
        }
        if let Ok(value) = env::var("DB_USER") {
            if !value.is_empty() {
                self.db_user = value;
            }
        }
        if let Ok(value) = env::var("DB_PASSWORD") {
            if !value.is_empty() {
                self.db_password = value;
            }
        }
        if let Ok(value) = env::var("DB_NAME") {
            if !value.is_empty() {
                self.db_name = value;
            }
        }
        if let Ok(value) = env::var("DB_PORT") {
            if !value.is_empty() {
                self.db_port = value
                    .parse()
                    .with_context(|| format!("invalid DB_PORT: {value}"))?;
            }
        }
        Ok(())
    }
}
