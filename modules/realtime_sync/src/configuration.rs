use std::time::Duration;

use anyhow::Result;
use config::Config;
use url::Url;

use crate::SyncError;

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SyncConfig {
    pub ws_url: String,
    #[serde(default = "defaults::reconnect_delay")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "defaults::heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

mod defaults {
    pub fn reconnect_delay() -> u64 {
        5
    }
    pub fn heartbeat_interval() -> u64 {
        5
    }
}

impl SyncConfig {
    pub fn try_load(config: &Config) -> Result<Self> {
        let full_config = Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config.default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config.clone())
            .build()?;
        Ok(full_config.try_deserialize()?)
    }

    pub fn settings(&self) -> Result<ConnectionSettings, SyncError> {
        let endpoint =
            Url::parse(&self.ws_url).map_err(|e| SyncError::InvalidEndpoint(self.ws_url.clone(), e))?;
        Ok(ConnectionSettings {
            endpoint,
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
        })
    }
}

/// Runtime settings of the connection manager
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub endpoint: Url,
    pub reconnect_delay: Duration,
    pub heartbeat_interval: Duration,
}
