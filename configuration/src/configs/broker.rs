use std::str::FromStr;

use serde_derive::Deserialize;

use crate::configs::deserialize_optional_data_or_env;

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    #[default]
    Redis,
    /// Process-local queues, lost on exit.
    Memory,
}

impl FromStr for BrokerBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "redis" => Ok(Self::Redis),
            "memory" => Ok(Self::Memory),
            _ => Err(anyhow::anyhow!("Unknown broker backend: {}", s)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub backend: BrokerBackend,
    pub redis_url: String,
    /// RabbitMQ-compatible management API. Queue stats come from the
    /// backend itself when unset.
    pub management_url: Option<String>,
    pub vhost: String,
    pub user: String,
    pub pass: String,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub(crate) struct CommonBrokerConfig {
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub backend: Option<BrokerBackend>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub redis_url: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub management_url: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub vhost: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub user: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub pass: Option<String>,
}

impl CommonBrokerConfig {
    pub fn default_redis_url() -> String {
        "redis://127.0.0.1:6379".to_string()
    }

    pub fn default_vhost() -> String {
        "/".to_string()
    }

    pub fn default_credential() -> String {
        "guest".to_string()
    }
}

impl From<CommonBrokerConfig> for BrokerConfig {
    fn from(common_config: CommonBrokerConfig) -> Self {
        Self {
            backend: common_config.backend.unwrap_or_default(),
            redis_url: common_config
                .redis_url
                .unwrap_or_else(CommonBrokerConfig::default_redis_url),
            management_url: common_config.management_url.filter(|url| !url.is_empty()),
            vhost: common_config
                .vhost
                .unwrap_or_else(CommonBrokerConfig::default_vhost),
            user: common_config
                .user
                .unwrap_or_else(CommonBrokerConfig::default_credential),
            pass: common_config
                .pass
                .unwrap_or_else(CommonBrokerConfig::default_credential),
        }
    }
}

impl BrokerConfig {
    /// Single-process setup used by tests and local runs.
    pub fn memory() -> Self {
        CommonBrokerConfig {
            backend: Some(BrokerBackend::Memory),
            ..Default::default()
        }
        .into()
    }
}
