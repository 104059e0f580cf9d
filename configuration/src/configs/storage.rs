use std::str::FromStr;

use serde_derive::Deserialize;

use crate::configs::deserialize_optional_data_or_env;

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Elasticsearch,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "elasticsearch" | "opensearch" => Ok(Self::Elasticsearch),
            "memory" => Ok(Self::Memory),
            _ => Err(anyhow::anyhow!("Unknown storage backend: {}", s)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub url: String,
    pub user: Option<String>,
    pub pass: Option<String>,
    /// Every index is named `{index_prefix}-{record kind}`.
    pub index_prefix: String,
    pub max_retry: usize,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub(crate) struct CommonStorageConfig {
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub backend: Option<StorageBackend>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub url: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub user: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub pass: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub index_prefix: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub max_retry: Option<usize>,
}

impl CommonStorageConfig {
    pub fn default_url() -> String {
        "http://127.0.0.1:9200".to_string()
    }

    pub fn default_max_retry() -> usize {
        3
    }
}

impl StorageConfig {
    pub(crate) fn from_common(common_config: CommonStorageConfig, chain: &str) -> Self {
        Self {
            backend: common_config.backend.unwrap_or_default(),
            url: common_config
                .url
                .unwrap_or_else(CommonStorageConfig::default_url),
            user: common_config.user.filter(|user| !user.is_empty()),
            pass: common_config.pass,
            index_prefix: common_config
                .index_prefix
                .filter(|prefix| !prefix.is_empty())
                .unwrap_or_else(|| chain.to_string()),
            max_retry: common_config
                .max_retry
                .unwrap_or_else(CommonStorageConfig::default_max_retry),
        }
    }

    pub fn memory(index_prefix: &str) -> Self {
        Self::from_common(
            CommonStorageConfig {
                backend: Some(StorageBackend::Memory),
                ..Default::default()
            },
            index_prefix,
        )
    }
}
