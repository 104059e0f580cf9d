//! Durable named work queues between pipeline stages.
//!
//! Delivery is at-least-once: a fetched message stays owned by its consumer
//! until it is acked, and goes back to the head of its queue when rejected
//! with requeue, when the consumer is cancelled, or when the consumer dies.
use std::sync::Arc;
use std::time::Duration;

mod management;
mod memory;
mod redis_fabric;

pub use management::HttpManagementClient;
pub use memory::MemoryQueueFabric;
pub use redis_fabric::RedisQueueFabric;

pub(crate) const QUEUE: &str = "queue";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Consumer-local sequence number.
    pub id: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
pub struct QueueInfo {
    #[serde(default)]
    pub name: String,
    /// Ready plus unacknowledged messages.
    #[serde(default)]
    pub messages: u64,
    #[serde(default)]
    pub consumers: u64,
}

#[async_trait::async_trait]
pub trait QueueFabric: Send + Sync {
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> anyhow::Result<()>;

    async fn publish_batch(&self, queue: &str, payloads: Vec<Vec<u8>>) -> anyhow::Result<()> {
        for payload in payloads {
            self.publish(queue, payload).await?;
        }
        Ok(())
    }

    /// Subscribes `tag` to `queue`.
    async fn consumer(&self, queue: &str, tag: &str) -> anyhow::Result<Box<dyn QueueConsumer>>;

    /// Returns messages held by every registered consumer of `queue` to its
    /// head. Only safe while none of those consumers is running.
    async fn recover(&self, _queue: &str) -> anyhow::Result<u64> {
        Ok(0)
    }

    /// Returns messages held by the consumer `tag` to the head of `queue` once
    /// that consumer is gone. Fabrics that redeliver on drop have nothing to do.
    async fn release(&self, _queue: &str, _tag: &str) -> anyhow::Result<u64> {
        Ok(0)
    }
}

#[async_trait::async_trait]
pub trait QueueConsumer: Send {
    fn queue(&self) -> &str;

    /// Waits up to `wait` for the first message, then takes whatever else is
    /// ready up to `max`.
    async fn fetch(&mut self, max: usize, wait: Duration) -> anyhow::Result<Vec<Delivery>>;

    async fn ack(&mut self, deliveries: &[Delivery]) -> anyhow::Result<()>;

    async fn reject(&mut self, deliveries: &[Delivery], requeue: bool) -> anyhow::Result<()>;

    /// Ends the subscription, returning unacked messages to the queue head.
    async fn cancel(self: Box<Self>) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
pub trait BrokerManagement: Send + Sync {
    async fn queue_info(&self, queue: &str) -> anyhow::Result<QueueInfo>;

    async fn purge(&self, queue: &str) -> anyhow::Result<()>;

    async fn delete(&self, queue: &str) -> anyhow::Result<()>;
}

/// Builds the queue fabric and its management surface for the configured backend.
pub async fn prepare_queue_fabric(
    config: &configuration::BrokerConfig,
) -> anyhow::Result<(Arc<dyn QueueFabric>, Arc<dyn BrokerManagement>)> {
    match config.backend {
        configuration::BrokerBackend::Memory => {
            let fabric = MemoryQueueFabric::default();
            Ok((Arc::new(fabric.clone()), Arc::new(fabric)))
        }
        configuration::BrokerBackend::Redis => {
            let fabric = RedisQueueFabric::new(config.redis_url.clone()).await?;
            let management: Arc<dyn BrokerManagement> = match &config.management_url {
                Some(url) => Arc::new(HttpManagementClient::new(
                    url.clone(),
                    config.vhost.clone(),
                    config.user.clone(),
                    config.pass.clone(),
                )),
                None => Arc::new(fabric.clone()),
            };
            Ok((Arc::new(fabric), management))
        }
    }
}
