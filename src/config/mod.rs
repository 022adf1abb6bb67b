pub mod display;
pub mod types;
pub mod validate;

pub use display::display_config;
pub use types::{BackendConfig, Config, EngineParams, RouteConfig, ServerConfig};
pub use validate::validate_configs;

use crate::error::Result;
use std::str::FromStr;

/// Top-level parsed config file: one or more virtual-host server blocks.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub servers: Vec<ServerConfig>,
}

impl AppConfig {
    pub fn from_str(content: &str) -> Result<Self> {
        let raw: Config = serde_yaml::from_str(content)?;
        let servers = validate_configs(raw.servers);
        Ok(Self { servers })
    }

    pub fn display_config(&self) {
        display_config(&self.servers);
    }
}

impl FromStr for ServerConfig {
    type Err = crate::error::CleanError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let cfg: ServerConfig = serde_yaml::from_str(s)?;
        Ok(cfg)
    }
}
