use ship_primitives::AbiRecord;

#[async_trait::async_trait]
pub trait ReaderDbManager: Send + Sync {
    /// Highest block number present in the block index.
    async fn get_last_indexed_block(&self) -> anyhow::Result<Option<u32>>;

    /// Latest ABI of `account` set at or before `block_num`.
    async fn get_abi_at_block(
        &self,
        account: &str,
        block_num: u32,
    ) -> anyhow::Result<Option<AbiRecord>>;
}
