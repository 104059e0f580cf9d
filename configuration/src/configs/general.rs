use serde_derive::Deserialize;

use crate::configs::{deserialize_optional_data_or_env, required_value};

#[derive(Debug, Clone)]
pub struct GeneralConfig {
    /// Short chain name, used as the prefix of every queue and index.
    pub chain: String,
    /// Expected chain id. When unset the id reported by the chain API is trusted.
    pub chain_id: Option<String>,
    pub eosio_alias: String,
    pub chain_api: String,
    pub server_port: u16,
    pub max_ws_payload_mb: usize,
    /// Directory of the `.{chain}_lastblock.txt` file.
    pub data_dir: String,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub(crate) struct CommonGeneralConfig {
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub chain: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub chain_id: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub eosio_alias: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub chain_api: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub server_port: Option<u16>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub max_ws_payload_mb: Option<usize>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub data_dir: Option<String>,
}

impl CommonGeneralConfig {
    pub fn default_eosio_alias() -> String {
        "eosio".to_string()
    }

    pub fn default_server_port() -> u16 {
        9090
    }

    pub fn default_max_ws_payload_mb() -> usize {
        256
    }

    pub fn default_data_dir() -> String {
        ".".to_string()
    }
}

impl TryFrom<CommonGeneralConfig> for GeneralConfig {
    type Error = anyhow::Error;

    fn try_from(common_config: CommonGeneralConfig) -> anyhow::Result<Self> {
        Ok(Self {
            chain: required_value("general.chain", common_config.chain)?,
            chain_id: common_config
                .chain_id
                .filter(|chain_id| !chain_id.is_empty()),
            eosio_alias: common_config
                .eosio_alias
                .unwrap_or_else(CommonGeneralConfig::default_eosio_alias),
            chain_api: required_value("general.chain_api", common_config.chain_api)?,
            server_port: common_config
                .server_port
                .unwrap_or_else(CommonGeneralConfig::default_server_port),
            max_ws_payload_mb: common_config
                .max_ws_payload_mb
                .unwrap_or_else(CommonGeneralConfig::default_max_ws_payload_mb),
            data_dir: common_config
                .data_dir
                .unwrap_or_else(CommonGeneralConfig::default_data_dir),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShipEndpointConfig {
    pub url: String,
    pub label: String,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub(crate) struct CommonShipEndpointConfig {
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub url: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub label: Option<String>,
}

impl CommonShipEndpointConfig {
    /// Entries whose url resolved to nothing are dropped.
    pub(crate) fn resolve(self, index: usize) -> Option<ShipEndpointConfig> {
        let url = self.url.filter(|url| !url.is_empty())?;
        let label = self.label.unwrap_or_else(|| match index {
            0 => "primary".to_string(),
            n => format!("node-{}", n + 1),
        });
        Some(ShipEndpointConfig { url, label })
    }
}
