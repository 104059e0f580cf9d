use serde_derive::Deserialize;

use crate::configs::deserialize_optional_data_or_env;

#[derive(Debug, Clone)]
pub struct ScalingConfig {
    pub readers: usize,
    pub batch_size: u64,
    pub ds_queues: usize,
    pub ds_threads: usize,
    pub indexing_queues: usize,
    pub ad_idx_queues: usize,
    pub dyn_idx_queues: usize,
    pub max_autoscale: usize,
    pub auto_scale_trigger: u64,
    pub max_queue_limit: Option<u64>,
    pub block_queue_limit: Option<u64>,
    pub resume_trigger: Option<u64>,
    /// Queue monitor period in milliseconds.
    pub polling_interval: u64,
}

/// Backpressure thresholds, present and consistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    pub max_queue_limit: u64,
    pub block_queue_limit: u64,
    pub resume_trigger: u64,
}

impl ScalingConfig {
    pub fn queue_limits(&self) -> anyhow::Result<QueueLimits> {
        let Some(max_queue_limit) = self.max_queue_limit else {
            anyhow::bail!("scaling.max_queue_limit is not defined!");
        };
        let Some(resume_trigger) = self.resume_trigger else {
            anyhow::bail!("scaling.resume_trigger is not defined!");
        };
        let Some(block_queue_limit) = self.block_queue_limit else {
            anyhow::bail!("scaling.block_queue_limit is not defined!");
        };
        if resume_trigger >= max_queue_limit {
            anyhow::bail!(
                "scaling.resume_trigger ({}) must be lower than scaling.max_queue_limit ({})",
                resume_trigger,
                max_queue_limit
            );
        }
        Ok(QueueLimits {
            max_queue_limit,
            block_queue_limit,
            resume_trigger,
        })
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub(crate) struct CommonScalingConfig {
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub readers: Option<usize>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub batch_size: Option<u64>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub ds_queues: Option<usize>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub ds_threads: Option<usize>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub indexing_queues: Option<usize>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub ad_idx_queues: Option<usize>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub dyn_idx_queues: Option<usize>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub max_autoscale: Option<usize>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub auto_scale_trigger: Option<u64>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub max_queue_limit: Option<u64>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub block_queue_limit: Option<u64>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub resume_trigger: Option<u64>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub polling_interval: Option<u64>,
}

impl CommonScalingConfig {
    pub fn default_readers() -> usize {
        1
    }

    pub fn default_batch_size() -> u64 {
        5000
    }

    pub fn default_queues() -> usize {
        1
    }

    pub fn default_max_autoscale() -> usize {
        4
    }

    pub fn default_auto_scale_trigger() -> u64 {
        20000
    }

    pub fn default_polling_interval() -> u64 {
        20000
    }
}

impl From<CommonScalingConfig> for ScalingConfig {
    fn from(common_config: CommonScalingConfig) -> Self {
        Self {
            readers: common_config
                .readers
                .unwrap_or_else(CommonScalingConfig::default_readers),
            batch_size: common_config
                .batch_size
                .filter(|size| *size > 0)
                .unwrap_or_else(CommonScalingConfig::default_batch_size),
            ds_queues: common_config
                .ds_queues
                .filter(|n| *n > 0)
                .unwrap_or_else(CommonScalingConfig::default_queues),
            ds_threads: common_config
                .ds_threads
                .filter(|n| *n > 0)
                .unwrap_or_else(CommonScalingConfig::default_queues),
            indexing_queues: common_config
                .indexing_queues
                .filter(|n| *n > 0)
                .unwrap_or_else(CommonScalingConfig::default_queues),
            ad_idx_queues: common_config
                .ad_idx_queues
                .filter(|n| *n > 0)
                .unwrap_or_else(CommonScalingConfig::default_queues),
            dyn_idx_queues: common_config
                .dyn_idx_queues
                .filter(|n| *n > 0)
                .unwrap_or_else(CommonScalingConfig::default_queues),
            max_autoscale: common_config
                .max_autoscale
                .unwrap_or_else(CommonScalingConfig::default_max_autoscale),
            auto_scale_trigger: common_config
                .auto_scale_trigger
                .unwrap_or_else(CommonScalingConfig::default_auto_scale_trigger),
            max_queue_limit: common_config.max_queue_limit,
            block_queue_limit: common_config.block_queue_limit,
            resume_trigger: common_config.resume_trigger,
            polling_interval: common_config
                .polling_interval
                .filter(|ms| *ms > 0)
                .unwrap_or_else(CommonScalingConfig::default_polling_interval),
        }
    }
}

/// Batch sizes of the three stages.
#[derive(Debug, Clone)]
pub struct PrefetchConfig {
    /// Credits granted to the history node per request.
    pub read: u32,
    /// Stage-1 messages fetched per deserializer round.
    pub block: usize,
    /// Records per bulk write.
    pub index: usize,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub(crate) struct CommonPrefetchConfig {
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub read: Option<u32>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub block: Option<usize>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub index: Option<usize>,
}

impl From<CommonPrefetchConfig> for PrefetchConfig {
    fn from(common_config: CommonPrefetchConfig) -> Self {
        Self {
            read: common_config.read.filter(|n| *n > 0).unwrap_or(50),
            block: common_config.block.filter(|n| *n > 0).unwrap_or(100),
            index: common_config.index.filter(|n| *n > 0).unwrap_or(500),
        }
    }
}
