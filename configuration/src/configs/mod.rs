use std::str::FromStr;

use serde::Deserialize;

pub(crate) mod broker;
pub(crate) mod filters;
pub(crate) mod general;
pub(crate) mod indexer;
pub(crate) mod scaling;
pub(crate) mod storage;

lazy_static::lazy_static! {
    static ref RE_NAME_ENV: regex::Regex = regex::Regex::new(r"\$\{(?<env_name>\w+)}").unwrap();
}

fn get_env_var<T>(env_var_name: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Debug,
{
    let var = dotenv::var(env_var_name).map_err(|err| {
        anyhow::anyhow!(
            "Failed to get env var: {:?}. Error: {:?}",
            env_var_name,
            err
        )
    })?;
    var.parse::<T>().map_err(|err| {
        anyhow::anyhow!(
            "Failed to parse env var: {:?}. Error: {:?}",
            env_var_name,
            err
        )
    })
}

fn deserialize_data_or_env<'de, D, T>(data: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: serde::de::DeserializeOwned + FromStr,
    <T as FromStr>::Err: std::fmt::Debug,
{
    let value = serde_json::Value::deserialize(data)?;
    if let serde_json::Value::String(value) = &value {
        if let Some(caps) = RE_NAME_ENV.captures(value) {
            return get_env_var::<T>(&caps["env_name"]).map_err(serde::de::Error::custom);
        }
    }
    serde_json::from_value::<T>(value).map_err(serde::de::Error::custom)
}

fn deserialize_optional_data_or_env<'de, D, T>(data: D) -> Result<Option<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: serde::de::DeserializeOwned + FromStr,
    <T as FromStr>::Err: std::fmt::Debug,
{
    Ok(match deserialize_data_or_env(data) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::debug!("Failed to deserialize_optional_data_or_env: {:?}", err);
            None
        }
    })
}

/// Comma separated list, either inline or from an env var.
fn deserialize_list_or_env<'de, D>(data: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(data)?;
    let raw = match value {
        serde_json::Value::String(value) => match RE_NAME_ENV.captures(&value) {
            Some(caps) => dotenv::var(&caps["env_name"]).unwrap_or_default(),
            None => value,
        },
        other => {
            return serde_json::from_value::<Vec<String>>(other).map_err(serde::de::Error::custom)
        }
    };
    Ok(raw
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect())
}

fn required_value<T>(field_name: &str, value: Option<T>) -> anyhow::Result<T> {
    value.ok_or_else(|| anyhow::anyhow!("Value {} is required in the config", field_name))
}

#[derive(Deserialize, Debug, Clone, Default)]
pub(crate) struct CommonConfig {
    pub general: general::CommonGeneralConfig,
    #[serde(default)]
    pub ship: Vec<general::CommonShipEndpointConfig>,
    #[serde(default)]
    pub scaling: scaling::CommonScalingConfig,
    #[serde(default)]
    pub indexer: indexer::CommonIndexerConfig,
    #[serde(default)]
    pub prefetch: scaling::CommonPrefetchConfig,
    #[serde(default)]
    pub filters: filters::FiltersConfig,
    #[serde(default)]
    pub features: indexer::CommonFeaturesConfig,
    #[serde(default)]
    pub broker: broker::CommonBrokerConfig,
    #[serde(default)]
    pub storage: storage::CommonStorageConfig,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub general: general::GeneralConfig,
    pub ship: Vec<general::ShipEndpointConfig>,
    pub scaling: scaling::ScalingConfig,
    pub indexer: indexer::IndexerConfig,
    pub prefetch: scaling::PrefetchConfig,
    pub filters: filters::FiltersConfig,
    pub features: indexer::FeaturesConfig,
    pub broker: broker::BrokerConfig,
    pub storage: storage::StorageConfig,
}

impl TryFrom<CommonConfig> for Config {
    type Error = anyhow::Error;

    fn try_from(common_config: CommonConfig) -> anyhow::Result<Self> {
        let general = general::GeneralConfig::try_from(common_config.general)?;
        let storage = storage::StorageConfig::from_common(common_config.storage, &general.chain);
        Ok(Self {
            ship: common_config
                .ship
                .into_iter()
                .enumerate()
                .filter_map(|(index, ship)| ship.resolve(index))
                .collect(),
            scaling: common_config.scaling.into(),
            indexer: common_config.indexer.into(),
            prefetch: common_config.prefetch.into(),
            filters: common_config.filters,
            features: common_config.features.into(),
            broker: common_config.broker.into(),
            storage,
            general,
        })
    }
}
