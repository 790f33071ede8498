use std::path::PathBuf;

use anyhow::Result;
use config::Config;

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FetcherConfig {
    pub api_base: String,
    #[serde(default = "defaults::request_timeout")]
    pub request_timeout_secs: u64,
    /// Where the session is persisted, in memory only if unset
    #[serde(default)]
    pub session_file: Option<PathBuf>,
}

mod defaults {
    pub fn request_timeout() -> u64 {
        10
    }
}

impl FetcherConfig {
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
}
