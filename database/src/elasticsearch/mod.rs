use std::collections::HashMap;

use serde::Deserialize;
use tokio_retry::{strategy::FixedInterval, Retry};

use crate::base::indexer::BulkOperation;
use crate::base::BulkItemStatus;

mod indexer;
mod reader;

/// Storage over the Elasticsearch/OpenSearch HTTP API.
#[derive(Debug, Clone)]
pub struct ElasticsearchDbManager {
    client: reqwest::Client,
    url: String,
    user: Option<String>,
    pass: Option<String>,
    index_prefix: String,
    max_retry: usize,
}

#[async_trait::async_trait]
impl crate::BaseDbManager for ElasticsearchDbManager {
    async fn new(config: &configuration::StorageConfig) -> anyhow::Result<Box<Self>> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(Box::new(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            user: config.user.clone(),
            pass: config.pass.clone(),
            index_prefix: config.index_prefix.clone(),
            max_retry: config.max_retry,
        }))
    }
}

#[derive(Deserialize, Debug)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    items: Vec<HashMap<String, BulkResponseItem>>,
}

#[derive(Deserialize, Debug)]
struct BulkResponseItem {
    status: u16,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize, Debug)]
struct SearchResponse<T> {
    hits: SearchHits<T>,
}

#[derive(Deserialize, Debug)]
struct SearchHits<T> {
    hits: Vec<SearchHit<T>>,
}

#[derive(Deserialize, Debug)]
struct SearchHit<T> {
    #[serde(rename = "_source")]
    source: T,
}

impl ElasticsearchDbManager {
    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}/{}", self.url, path));
        match &self.user {
            Some(user) => builder.basic_auth(user, self.pass.as_ref()),
            None => builder,
        }
    }

    fn retry_strategy(&self) -> std::iter::Take<FixedInterval> {
        FixedInterval::from_millis(500).take(self.max_retry)
    }

    async fn send_bulk(&self, body: &str) -> anyhow::Result<BulkResponse> {
        crate::metrics::DATABASE_QUERIES
            .with_label_values(&["bulk_write", &self.index_prefix])
            .inc();
        let response = self
            .request(reqwest::Method::POST, "_bulk")
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body.to_string())
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    /// Runs a search returning at most one hit; a missing index counts as empty.
    async fn search_one<T>(&self, index: &str, query: serde_json::Value) -> anyhow::Result<Option<T>>
    where
        T: serde::de::DeserializeOwned,
    {
        crate::metrics::DATABASE_QUERIES
            .with_label_values(&["search", index])
            .inc();
        let path = format!("{}/_search", index);
        let response = Retry::start(self.retry_strategy(), || async {
            self.request(reqwest::Method::POST, &path)
                .json(&query)
                .send()
                .await
        })
        .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let search: SearchResponse<T> = response.error_for_status()?.json().await?;
        Ok(search.hits.hits.into_iter().next().map(|hit| hit.source))
    }
}

/// Newline delimited `_bulk` body.
pub(crate) fn bulk_body(operations: &[BulkOperation]) -> anyhow::Result<String> {
    let mut body = String::new();
    for operation in operations {
        let mut action = serde_json::json!({
            "_index": operation.index,
            "_id": operation.id,
        });
        if let Some(version) = operation.version {
            action["version"] = version.into();
            action["version_type"] = "external".into();
        }
        body.push_str(&serde_json::to_string(&serde_json::json!({ "index": action }))?);
        body.push('\n');
        body.push_str(&serde_json::to_string(&operation.document)?);
        body.push('\n');
    }
    Ok(body)
}

fn item_status(item: BulkResponseItem, operation: &BulkOperation) -> BulkItemStatus {
    match item.status {
        200..=299 => BulkItemStatus::Written,
        409 if operation.version.is_some() => BulkItemStatus::Stale,
        status => {
            let reason = item
                .error
                .map(|error| {
                    format!(
                        "{}: {}",
                        error["type"].as_str().unwrap_or("error"),
                        error["reason"].as_str().unwrap_or_default()
                    )
                })
                .unwrap_or_else(|| format!("status {}", status));
            BulkItemStatus::Failed(reason)
        }
    }
}
