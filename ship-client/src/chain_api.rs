//! Minimal client for the node's HTTP chain API.
use abi_codec::AbiDef;
use serde::Deserialize;

use crate::error::Result;

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ChainInfo {
    pub server_version: String,
    pub chain_id: String,
    pub head_block_num: u32,
    pub last_irreversible_block_num: u32,
    #[serde(default)]
    pub server_version_string: Option<String>,
}

#[derive(Deserialize, Debug)]
struct GetAbiResponse {
    #[allow(dead_code)]
    account_name: String,
    #[serde(default)]
    abi: Option<AbiDef>,
}

#[derive(Debug, Clone)]
pub struct ChainApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl ChainApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn get_info(&self) -> Result<ChainInfo> {
        Ok(self
            .client
            .get(format!("{}/v1/chain/get_info", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    /// Current ABI of `account`, `None` when no contract is deployed.
    pub async fn get_abi(&self, account: &str) -> Result<Option<AbiDef>> {
        let response: GetAbiResponse = self
            .client
            .post(format!("{}/v1/chain/get_abi", self.base_url))
            .json(&serde_json::json!({ "account_name": account }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.abi)
    }
}
