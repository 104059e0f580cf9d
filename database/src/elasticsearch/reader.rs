use ship_primitives::{AbiRecord, RecordKind};

use crate::base::index_name;
use crate::elasticsearch::ElasticsearchDbManager;

#[derive(serde::Deserialize)]
struct BlockNumOnly {
    block_num: u32,
}

#[async_trait::async_trait]
impl crate::ReaderDbManager for ElasticsearchDbManager {
    async fn get_last_indexed_block(&self) -> anyhow::Result<Option<u32>> {
        let index = index_name(&self.index_prefix, RecordKind::Block);
        let hit: Option<BlockNumOnly> = self
            .search_one(
                &index,
                serde_json::json!({
                    "size": 1,
                    "_source": ["block_num"],
                    "query": {"match_all": {}},
                    "sort": [{"block_num": {"order": "desc"}}]
                }),
            )
            .await?;
        Ok(hit.map(|hit| hit.block_num))
    }

    async fn get_abi_at_block(
        &self,
        account: &str,
        block_num: u32,
    ) -> anyhow::Result<Option<AbiRecord>> {
        let index = index_name(&self.index_prefix, RecordKind::Abi);
        self.search_one(
            &index,
            serde_json::json!({
                "size": 1,
                "query": {"bool": {"must": [
                    {"term": {"account": account}},
                    {"range": {"block": {"lte": block_num}}}
                ]}},
                "sort": [{"block": {"order": "desc"}}]
            }),
        )
        .await
    }
}
