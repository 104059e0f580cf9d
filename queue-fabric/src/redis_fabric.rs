use std::collections::BTreeMap;
use std::time::Duration;

use crate::{BrokerManagement, Delivery, QueueConsumer, QueueFabric, QueueInfo};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

fn unacked_key(queue: &str, tag: &str) -> String {
    format!("{queue}:unacked:{tag}")
}

fn consumers_key(queue: &str) -> String {
    format!("{queue}:consumers")
}

/// Queues stored as Redis lists. Each consumer moves fetched messages into
/// its own unacked list, so a crashed consumer leaves them recoverable.
#[derive(Clone)]
pub struct RedisQueueFabric {
    client: redis::Client,
    connection: redis::aio::ConnectionManager,
}

impl RedisQueueFabric {
    pub async fn new(redis_url: String) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let connection = client.get_connection_manager().await?;
        Ok(Self { client, connection })
    }
}

/// Moves everything in the unacked list of `tag` back to the queue head,
/// oldest message first in line.
async fn requeue_all(
    connection: &mut redis::aio::ConnectionManager,
    queue: &str,
    tag: &str,
) -> anyhow::Result<u64> {
    let mut moved = 0;
    loop {
        let message: Option<Vec<u8>> = redis::cmd("LMOVE")
            .arg(unacked_key(queue, tag))
            .arg(queue)
            .arg("RIGHT")
            .arg("LEFT")
            .query_async(connection)
            .await?;
        if message.is_none() {
            return Ok(moved);
        }
        moved += 1;
    }
}

#[async_trait::async_trait]
impl QueueFabric for RedisQueueFabric {
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        redis::cmd("RPUSH")
            .arg(queue)
            .arg(payload)
            .query_async::<()>(&mut self.connection.clone())
            .await?;
        Ok(())
    }

    async fn publish_batch(&self, queue: &str, payloads: Vec<Vec<u8>>) -> anyhow::Result<()> {
        if payloads.is_empty() {
            return Ok(());
        }
        redis::cmd("RPUSH")
            .arg(queue)
            .arg(payloads)
            .query_async::<()>(&mut self.connection.clone())
            .await?;
        Ok(())
    }

    async fn consumer(&self, queue: &str, tag: &str) -> anyhow::Result<Box<dyn QueueConsumer>> {
        let mut connection = self.client.get_connection_manager().await?;
        // leftovers of a crashed consumer with the same tag
        let recovered = requeue_all(&mut connection, queue, tag).await?;
        if recovered > 0 {
            tracing::info!(
                target: crate::QUEUE,
                "Consumer {} recovered {} unacked messages on {}",
                tag,
                recovered,
                queue
            );
        }
        redis::cmd("SADD")
            .arg(consumers_key(queue))
            .arg(tag)
            .query_async::<()>(&mut connection)
            .await?;
        Ok(Box::new(RedisQueueConsumer {
            connection,
            queue: queue.to_string(),
            tag: tag.to_string(),
            next_id: 0,
            in_flight: BTreeMap::new(),
        }))
    }

    /// Returns messages left unacked by consumers of a previous run to the
    /// head of `queue` and forgets those consumers.
    async fn recover(&self, queue: &str) -> anyhow::Result<u64> {
        let tags: Vec<String> = redis::cmd("SMEMBERS")
            .arg(consumers_key(queue))
            .query_async(&mut self.connection.clone())
            .await?;
        let mut recovered = 0;
        for tag in tags {
            recovered += requeue_all(&mut self.connection.clone(), queue, &tag).await?;
        }
        redis::cmd("DEL")
            .arg(consumers_key(queue))
            .query_async::<()>(&mut self.connection.clone())
            .await?;
        if recovered > 0 {
            tracing::info!(
                target: crate::QUEUE,
                "Recovered {} unacked messages on {}",
                recovered,
                queue
            );
        }
        Ok(recovered)
    }

    async fn release(&self, queue: &str, tag: &str) -> anyhow::Result<u64> {
        let mut connection = self.connection.clone();
        let released = requeue_all(&mut connection, queue, tag).await?;
        redis::cmd("SREM")
            .arg(consumers_key(queue))
            .arg(tag)
            .query_async::<()>(&mut connection)
            .await?;
        Ok(released)
    }
}

#[async_trait::async_trait]
impl BrokerManagement for RedisQueueFabric {
    async fn queue_info(&self, queue: &str) -> anyhow::Result<QueueInfo> {
        let mut connection = self.connection.clone();
        let tags: Vec<String> = redis::cmd("SMEMBERS")
            .arg(consumers_key(queue))
            .query_async(&mut connection)
            .await?;
        let mut pipe = redis::pipe();
        pipe.cmd("LLEN").arg(queue);
        for tag in &tags {
            pipe.cmd("LLEN").arg(unacked_key(queue, tag));
        }
        let lengths: Vec<u64> = pipe.query_async(&mut connection).await?;
        Ok(QueueInfo {
            name: queue.to_string(),
            messages: lengths.iter().sum(),
            consumers: tags.len() as u64,
        })
    }

    async fn purge(&self, queue: &str) -> anyhow::Result<()> {
        redis::cmd("DEL")
            .arg(queue)
            .query_async::<()>(&mut self.connection.clone())
            .await?;
        Ok(())
    }

    async fn delete(&self, queue: &str) -> anyhow::Result<()> {
        let mut connection = self.connection.clone();
        let tags: Vec<String> = redis::cmd("SMEMBERS")
            .arg(consumers_key(queue))
            .query_async(&mut connection)
            .await?;
        let mut keys = vec![queue.to_string(), consumers_key(queue)];
        keys.extend(tags.iter().map(|tag| unacked_key(queue, tag)));
        redis::cmd("DEL")
            .arg(keys)
            .query_async::<()>(&mut connection)
            .await?;
        Ok(())
    }
}

pub struct RedisQueueConsumer {
    connection: redis::aio::ConnectionManager,
    queue: String,
    tag: String,
    next_id: u64,
    in_flight: BTreeMap<u64, Vec<u8>>,
}

impl RedisQueueConsumer {
    async fn take_ready(&mut self, max: usize) -> anyhow::Result<Vec<Delivery>> {
        let mut pipe = redis::pipe();
        for _ in 0..max {
            pipe.cmd("LMOVE")
                .arg(&self.queue)
                .arg(unacked_key(&self.queue, &self.tag))
                .arg("LEFT")
                .arg("RIGHT");
        }
        let moved: Vec<Option<Vec<u8>>> = pipe.query_async(&mut self.connection).await?;
        Ok(moved
            .into_iter()
            .flatten()
            .map(|payload| {
                self.next_id += 1;
                self.in_flight.insert(self.next_id, payload.clone());
                Delivery {
                    id: self.next_id,
                    payload,
                }
            })
            .collect())
    }

    async fn remove_unacked(&mut self, deliveries: &[Delivery]) -> anyhow::Result<Vec<Vec<u8>>> {
        let payloads: Vec<Vec<u8>> = deliveries
            .iter()
            .filter_map(|d| self.in_flight.remove(&d.id))
            .collect();
        if payloads.is_empty() {
            return Ok(payloads);
        }
        let mut pipe = redis::pipe();
        for payload in &payloads {
            pipe.cmd("LREM")
                .arg(unacked_key(&self.queue, &self.tag))
                .arg(1)
                .arg(payload)
                .ignore();
        }
        pipe.query_async::<()>(&mut self.connection).await?;
        Ok(payloads)
    }
}

#[async_trait::async_trait]
impl QueueConsumer for RedisQueueConsumer {
    fn queue(&self) -> &str {
        &self.queue
    }

    async fn fetch(&mut self, max: usize, wait: Duration) -> anyhow::Result<Vec<Delivery>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let deliveries = self.take_ready(max).await?;
            if !deliveries.is_empty() || tokio::time::Instant::now() >= deadline {
                return Ok(deliveries);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn ack(&mut self, deliveries: &[Delivery]) -> anyhow::Result<()> {
        self.remove_unacked(deliveries).await?;
        Ok(())
    }

    async fn reject(&mut self, deliveries: &[Delivery], requeue: bool) -> anyhow::Result<()> {
        let payloads = self.remove_unacked(deliveries).await?;
        if requeue && !payloads.is_empty() {
            // LPUSH reverses its arguments, so push newest first
            redis::cmd("LPUSH")
                .arg(&self.queue)
                .arg(payloads.into_iter().rev().collect::<Vec<_>>())
                .query_async::<()>(&mut self.connection)
                .await?;
        }
        Ok(())
    }

    async fn cancel(mut self: Box<Self>) -> anyhow::Result<()> {
        self.in_flight.clear();
        requeue_all(&mut self.connection, &self.queue, &self.tag).await?;
        redis::cmd("SREM")
            .arg(consumers_key(&self.queue))
            .arg(&self.tag)
            .query_async::<()>(&mut self.connection)
            .await?;
        Ok(())
    }
}
