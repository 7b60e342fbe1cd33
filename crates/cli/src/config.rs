//! Application configuration file.

use std::path::Path;

use anyhow::Context;
use cache::CacheConfig;
use gateway::GatewayConfig;
use monitor::MonitorConfig;
use serde::{Deserialize, Serialize};

/// Top-level JSON document read at startup. Every section is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub gateway: GatewayConfig,
    pub cache: CacheConfig,
    pub monitor: MonitorConfig,
}

impl AppConfig {
    /// Reads and validates `path`, or returns defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                Self::parse(&raw).with_context(|| format!("invalid config file {}", path.display()))?
            }
            None => Self::default(),
        };
        Ok(config)
    }

    fn parse(raw: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.gateway.validate()?;
        Ok(config)
    }
}
