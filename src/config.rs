use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StoreConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub batch: BatchConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConnectionConfig {
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_synchronous")]
    pub synchronous: String,
    #[serde(default = "default_checkpoint_on_close")]
    pub checkpoint_on_close: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: default_busy_timeout_ms(),
            synchronous: default_synchronous(),
            checkpoint_on_close: default_checkpoint_on_close(),
        }
    }
}

impl ConnectionConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

fn default_busy_timeout_ms() -> u64 {
    5000
}
fn default_synchronous() -> String {
    "normal".to_string()
}
fn default_checkpoint_on_close() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct BatchConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub fail_fast: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            fail_fast: false,
        }
    }
}

fn default_concurrency() -> usize {
    4
}

pub fn parse_config(content: &str) -> Result<StoreConfig> {
    let config: StoreConfig =
        toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.connection.busy_timeout_ms == 0 {
        anyhow::bail!("connection.busy_timeout_ms must be > 0");
    }

    match config.connection.synchronous.as_str() {
        "off" | "normal" | "full" => {}
        other => anyhow::bail!(
            "Unknown connection.synchronous: '{}'. Must be off, normal, or full.",
            other
        ),
    }

    if config.batch.concurrency == 0 {
        anyhow::bail!("batch.concurrency must be >= 1");
    }

    Ok(config)
}

pub fn load_config(path: &Path) -> Result<StoreConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}
