use serde_derive::Deserialize;

use crate::configs::{deserialize_list_or_env, deserialize_optional_data_or_env};

/// Raw filter rules as configured. Each rule is `chain::code::action`,
/// `chain::code::*` or `chain::*::action` (`table` in place of `action`
/// for deltas).
#[derive(Deserialize, Debug, Clone, Default)]
pub struct FiltersConfig {
    #[serde(deserialize_with = "deserialize_list_or_env", default)]
    pub action_blacklist: Vec<String>,
    #[serde(deserialize_with = "deserialize_list_or_env", default)]
    pub action_whitelist: Vec<String>,
    #[serde(deserialize_with = "deserialize_list_or_env", default)]
    pub delta_blacklist: Vec<String>,
    #[serde(deserialize_with = "deserialize_list_or_env", default)]
    pub delta_whitelist: Vec<String>,
    /// Whitelist decides on root actions only; inline children follow their root.
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub root_only: Option<bool>,
}

impl FiltersConfig {
    pub fn root_only(&self) -> bool {
        self.root_only.unwrap_or_default()
    }
}
