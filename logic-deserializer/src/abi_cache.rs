use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use abi_codec::{Abi, AbiDef};
use tokio::sync::RwLock;
use tokio_retry::{strategy::FixedInterval, Retry};

const CHAIN_API_ATTEMPTS: usize = 3;
/// How far past a lookup that found nothing the answer is reused.
const MISSING_ABI_BLOCKS: u32 = 7200;

/// Contract ABI valid from `valid_from` until the next known entry.
#[derive(Debug, Clone)]
pub struct AbiCacheEntry {
    pub contract: String,
    pub valid_from: u32,
    pub valid_until: Option<u32>,
    pub abi: Arc<Abi>,
}

/// ABI as returned by an [`AbiSource`].
#[derive(Debug, Clone)]
pub struct SourcedAbi {
    pub valid_from: u32,
    pub abi: AbiDef,
}

/// Where ABIs missing from the cache are looked up.
#[async_trait::async_trait]
pub trait AbiSource: Send + Sync {
    /// Latest ABI of `contract` set at or before `block_num`.
    async fn abi_at_block(&self, contract: &str, block_num: u32)
        -> anyhow::Result<Option<SourcedAbi>>;
}

/// Reads the `abi` index written by earlier runs.
pub struct StorageAbiSource {
    storage: Arc<dyn database::StorageDbManager>,
}

impl StorageAbiSource {
    pub fn new(storage: Arc<dyn database::StorageDbManager>) -> Self {
        Self { storage }
    }
}

#[async_trait::async_trait]
impl AbiSource for StorageAbiSource {
    async fn abi_at_block(
        &self,
        contract: &str,
        block_num: u32,
    ) -> anyhow::Result<Option<SourcedAbi>> {
        let Some(record) = self.storage.get_abi_at_block(contract, block_num).await? else {
            return Ok(None);
        };
        Ok(Some(SourcedAbi {
            valid_from: record.block,
            abi: AbiDef::from_json(&record.abi)?,
        }))
    }
}

/// Current ABI from the node. Only correct for blocks after the last
/// `setabi`, so it comes last in the chain.
pub struct ChainApiAbiSource {
    client: ship_client::ChainApiClient,
}

impl ChainApiAbiSource {
    pub fn new(client: ship_client::ChainApiClient) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl AbiSource for ChainApiAbiSource {
    async fn abi_at_block(
        &self,
        contract: &str,
        _block_num: u32,
    ) -> anyhow::Result<Option<SourcedAbi>> {
        let retry_strategy = FixedInterval::from_millis(500).take(CHAIN_API_ATTEMPTS);
        let abi = Retry::start(retry_strategy, || async {
            self.client.get_abi(contract).await.map_err(|err| {
                tracing::debug!(
                    target: crate::DESERIALIZER,
                    "get_abi for {} failed: {}",
                    contract,
                    err
                );
                err
            })
        })
        .await?;
        Ok(abi.map(|abi| SourcedAbi { valid_from: 0, abi }))
    }
}

/// Tries each source in order; a failing source is logged and skipped.
#[derive(Default)]
pub struct AbiSourceChain {
    sources: Vec<Box<dyn AbiSource>>,
}

impl AbiSourceChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: impl AbiSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }
}

#[async_trait::async_trait]
impl AbiSource for AbiSourceChain {
    async fn abi_at_block(
        &self,
        contract: &str,
        block_num: u32,
    ) -> anyhow::Result<Option<SourcedAbi>> {
        for source in &self.sources {
            match source.abi_at_block(contract, block_num).await {
                Ok(Some(abi)) => return Ok(Some(abi)),
                Ok(None) => {}
                Err(err) => tracing::warn!(
                    target: crate::DESERIALIZER,
                    "ABI lookup for {}@{} failed: {:#}",
                    contract,
                    block_num,
                    err
                ),
            }
        }
        Ok(None)
    }
}

#[derive(Default)]
struct CacheState {
    /// per contract, sorted by `valid_from`
    entries: HashMap<String, Vec<AbiCacheEntry>>,
    /// ABIs that could not be compiled, keyed by contract and height
    failed: HashMap<(String, u32), String>,
    /// highest block the sources had no usable ABI for, per contract
    missing: HashMap<String, u32>,
    /// members the sources could not add to the entry active from a height
    unknown_members: HashSet<(String, u32, String)>,
}

/// ABIs known to one deserializer, by contract and activation height.
pub struct AbiCache {
    state: RwLock<CacheState>,
    source: Box<dyn AbiSource>,
}

impl AbiCache {
    pub fn new(source: impl AbiSource + 'static) -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
            source: Box::new(source),
        }
    }

    /// Records `abi` as active from `valid_from`. An entry already present at
    /// the same height is kept.
    pub async fn insert(&self, contract: &str, valid_from: u32, abi: Arc<Abi>) -> bool {
        let mut state = self.state.write().await;
        state.failed.remove(&(contract.to_string(), valid_from));
        state.missing.remove(contract);
        let entries = state.entries.entry(contract.to_string()).or_default();
        let position = entries.partition_point(|entry| entry.valid_from < valid_from);
        if entries
            .get(position)
            .is_some_and(|entry| entry.valid_from == valid_from)
        {
            return false;
        }
        let valid_until = entries.get(position).map(|next| next.valid_from);
        entries.insert(
            position,
            AbiCacheEntry {
                contract: contract.to_string(),
                valid_from,
                valid_until,
                abi,
            },
        );
        if position > 0 {
            entries[position - 1].valid_until = Some(valid_from);
        }
        true
    }

    /// Cached ABI effective at `block_num`, without consulting any source.
    pub async fn at_block(&self, contract: &str, block_num: u32) -> Option<AbiCacheEntry> {
        let state = self.state.read().await;
        let entries = state.entries.get(contract)?;
        let position = entries.partition_point(|entry| entry.valid_from <= block_num);
        position.checked_sub(1).map(|index| entries[index].clone())
    }

    /// ABI effective at `block_num`. A cached entry is used when it knows
    /// `member` (an action or table name); otherwise the sources are asked,
    /// once per entry and member. Contracts the sources know nothing about
    /// are not asked for again for a while.
    pub async fn resolve(
        &self,
        contract: &str,
        block_num: u32,
        member: Option<&str>,
    ) -> anyhow::Result<Option<Arc<Abi>>> {
        let Some(entry) = self.at_block(contract, block_num).await else {
            if self.is_missing(contract, block_num).await {
                return Ok(None);
            }
            return self.fetch(contract, block_num).await;
        };
        let Some(name) = member else {
            return Ok(Some(entry.abi));
        };
        let member_key = (contract.to_string(), entry.valid_from, name.to_string());
        if knows_member(&entry.abi, name) || self.state.read().await.unknown_members.contains(&member_key) {
            return Ok(Some(entry.abi));
        }

        let fetched = self.fetch(contract, block_num).await?;
        if let Some(entry) = self.at_block(contract, block_num).await {
            if !knows_member(&entry.abi, name) {
                self.state.write().await.unknown_members.insert((
                    contract.to_string(),
                    entry.valid_from,
                    name.to_string(),
                ));
            }
        }
        Ok(fetched)
    }

    /// Asks the sources for the ABI at `block_num` and caches the answer,
    /// an empty one included.
    pub async fn fetch(&self, contract: &str, block_num: u32) -> anyhow::Result<Option<Arc<Abi>>> {
        let Some(sourced) = self.source.abi_at_block(contract, block_num).await? else {
            self.mark_missing(contract, block_num).await;
            return Ok(None);
        };
        if self.is_failed(contract, sourced.valid_from).await {
            self.mark_missing(contract, block_num).await;
            return Ok(None);
        }
        match Abi::new(sourced.abi) {
            Ok(abi) => {
                let abi = Arc::new(abi);
                self.insert(contract, sourced.valid_from, abi.clone()).await;
                Ok(Some(abi))
            }
            Err(err) => {
                self.mark_failed(contract, sourced.valid_from, err.to_string())
                    .await;
                self.mark_missing(contract, block_num).await;
                Ok(None)
            }
        }
    }

    async fn mark_missing(&self, contract: &str, block_num: u32) {
        let mut state = self.state.write().await;
        let checked = state.missing.entry(contract.to_string()).or_insert(block_num);
        *checked = (*checked).max(block_num);
    }

    async fn is_missing(&self, contract: &str, block_num: u32) -> bool {
        self.state
            .read()
            .await
            .missing
            .get(contract)
            .is_some_and(|checked| block_num <= checked.saturating_add(MISSING_ABI_BLOCKS))
    }

    pub async fn mark_failed(&self, contract: &str, block_num: u32, reason: String) {
        tracing::warn!(
            target: crate::DESERIALIZER,
            "ABI of {} at block {} is unusable: {}",
            contract,
            block_num,
            reason
        );
        self.state
            .write()
            .await
            .failed
            .insert((contract.to_string(), block_num), reason);
    }

    pub async fn is_failed(&self, contract: &str, block_num: u32) -> bool {
        self.state
            .read()
            .await
            .failed
            .contains_key(&(contract.to_string(), block_num))
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn knows_member(abi: &Abi, name: &str) -> bool {
    abi.action_type(name).is_some() || abi.table_type(name).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn abi_with_action(action: &str) -> AbiDef {
        AbiDef::from_json(&format!(
            r#"{{
                "version": "eosio::abi/1.1",
                "structs": [{{"name": "{action}", "base": "", "fields": [{{"name": "who", "type": "name"}}]}}],
                "actions": [{{"name": "{action}", "type": "{action}", "ricardian_contract": ""}}]
            }}"#
        ))
        .unwrap()
    }

    struct CountingSource {
        calls: Arc<AtomicUsize>,
        answer: Option<SourcedAbi>,
    }

    #[async_trait::async_trait]
    impl AbiSource for CountingSource {
        async fn abi_at_block(&self, _: &str, _: u32) -> anyhow::Result<Option<SourcedAbi>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.answer.clone())
        }
    }

    struct FailingSource;

    #[async_trait::async_trait]
    impl AbiSource for FailingSource {
        async fn abi_at_block(&self, _: &str, _: u32) -> anyhow::Result<Option<SourcedAbi>> {
            anyhow::bail!("storage unreachable")
        }
    }

    #[tokio::test]
    async fn lookup_by_height() {
        let cache = AbiCache::new(AbiSourceChain::new());
        let v1 = Arc::new(Abi::new(abi_with_action("hi")).unwrap());
        let v2 = Arc::new(Abi::new(abi_with_action("bye")).unwrap());
        assert!(cache.insert("alice", 100, v1).await);
        assert!(cache.insert("alice", 200, v2.clone()).await);
        assert!(!cache.insert("alice", 200, v2).await);

        assert!(cache.at_block("alice", 99).await.is_none());
        let first = cache.at_block("alice", 150).await.unwrap();
        assert_eq!(first.valid_from, 100);
        assert_eq!(first.valid_until, Some(200));
        let second = cache.at_block("alice", 200).await.unwrap();
        assert!(second.abi.action_type("bye").is_some());
        assert_eq!(second.valid_until, None);
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn misses_fall_through_to_sources() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = AbiCache::new(
            AbiSourceChain::new()
                .with_source(FailingSource)
                .with_source(CountingSource {
                    calls: calls.clone(),
                    answer: Some(SourcedAbi {
                        valid_from: 50,
                        abi: abi_with_action("hi"),
                    }),
                }),
        );
        let abi = cache.resolve("alice", 80, Some("hi")).await.unwrap();
        assert!(abi.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // served from the cache now
        cache.resolve("alice", 90, Some("hi")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // unknown action forces another lookup, but only one
        cache.resolve("alice", 90, Some("other")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let abi = cache.resolve("alice", 89, Some("other")).await.unwrap();
        assert!(abi.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn contracts_without_abi_are_not_looked_up_every_block() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = AbiCache::new(CountingSource {
            calls: calls.clone(),
            answer: None,
        });
        assert!(cache.resolve("bob", 1000, Some("hi")).await.unwrap().is_none());
        assert!(cache.resolve("bob", 999, Some("hi")).await.unwrap().is_none());
        assert!(cache.resolve("bob", 1001, Some("bye")).await.unwrap().is_none());
        assert!(cache
            .resolve("bob", 1000 + MISSING_ABI_BLOCKS, None)
            .await
            .unwrap()
            .is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache
            .resolve("bob", 1001 + MISSING_ABI_BLOCKS, None)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // a setabi seen later makes the contract decodable again
        let abi = Arc::new(Abi::new(abi_with_action("hi")).unwrap());
        cache.insert("bob", 1200, abi).await;
        assert!(cache.resolve("bob", 1300, Some("hi")).await.unwrap().is_some());
        assert!(cache.resolve("bob", 1100, Some("hi")).await.unwrap().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn broken_abis_are_remembered() {
        let mut broken = abi_with_action("hi");
        broken.structs[0].base = "missing".to_string();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = AbiCache::new(CountingSource {
            calls: calls.clone(),
            answer: Some(SourcedAbi {
                valid_from: 10,
                abi: broken,
            }),
        });
        assert!(cache.resolve("alice", 20, None).await.unwrap().is_none());
        assert!(cache.is_failed("alice", 10).await);
        assert!(cache.is_empty().await);
    }
}
