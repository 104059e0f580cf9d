use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::{BrokerManagement, Delivery, QueueConsumer, QueueFabric, QueueInfo};

#[derive(Default)]
struct MemoryQueue {
    ready: VecDeque<Vec<u8>>,
    unacked: u64,
    consumers: HashSet<String>,
}

#[derive(Default)]
struct Shared {
    queues: Mutex<HashMap<String, MemoryQueue>>,
    notify: tokio::sync::Notify,
}

/// Process-local queue fabric used for single-process runs and tests.
#[derive(Clone, Default)]
pub struct MemoryQueueFabric {
    shared: Arc<Shared>,
}

impl MemoryQueueFabric {
    fn queues(&self) -> MutexGuard<'_, HashMap<String, MemoryQueue>> {
        lock(&self.shared)
    }

    /// Number of ready messages, unacked ones excluded.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.queues().get(queue).map_or(0, |q| q.ready.len())
    }
}

fn lock(shared: &Shared) -> MutexGuard<'_, HashMap<String, MemoryQueue>> {
    // a poisoned lock only means another consumer panicked mid-operation
    shared
        .queues
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait::async_trait]
impl QueueFabric for MemoryQueueFabric {
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        self.queues()
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(payload);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn publish_batch(&self, queue: &str, payloads: Vec<Vec<u8>>) -> anyhow::Result<()> {
        self.queues()
            .entry(queue.to_string())
            .or_default()
            .ready
            .extend(payloads);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn consumer(&self, queue: &str, tag: &str) -> anyhow::Result<Box<dyn QueueConsumer>> {
        let inserted = self
            .queues()
            .entry(queue.to_string())
            .or_default()
            .consumers
            .insert(tag.to_string());
        if !inserted {
            anyhow::bail!("Consumer tag {} already subscribed to {}", tag, queue);
        }
        Ok(Box::new(MemoryQueueConsumer {
            shared: Arc::clone(&self.shared),
            queue: queue.to_string(),
            tag: tag.to_string(),
            next_id: 0,
            in_flight: BTreeMap::new(),
        }))
    }
}

#[async_trait::async_trait]
impl BrokerManagement for MemoryQueueFabric {
    async fn queue_info(&self, queue: &str) -> anyhow::Result<QueueInfo> {
        let queues = self.queues();
        Ok(queues
            .get(queue)
            .map(|q| QueueInfo {
                name: queue.to_string(),
                messages: q.ready.len() as u64 + q.unacked,
                consumers: q.consumers.len() as u64,
            })
            .unwrap_or_else(|| QueueInfo {
                name: queue.to_string(),
                ..Default::default()
            }))
    }

    async fn purge(&self, queue: &str) -> anyhow::Result<()> {
        if let Some(q) = self.queues().get_mut(queue) {
            q.ready.clear();
        }
        Ok(())
    }

    async fn delete(&self, queue: &str) -> anyhow::Result<()> {
        self.queues().remove(queue);
        Ok(())
    }
}

pub struct MemoryQueueConsumer {
    shared: Arc<Shared>,
    queue: String,
    tag: String,
    next_id: u64,
    in_flight: BTreeMap<u64, Vec<u8>>,
}

impl MemoryQueueConsumer {
    fn take_ready(&mut self, max: usize) -> Vec<Delivery> {
        let mut queues = lock(&self.shared);
        let Some(queue) = queues.get_mut(&self.queue) else {
            return vec![];
        };
        let count = max.min(queue.ready.len());
        queue.unacked += count as u64;
        let payloads: Vec<Vec<u8>> = queue.ready.drain(..count).collect();
        drop(queues);

        payloads
            .into_iter()
            .map(|payload| {
                self.next_id += 1;
                self.in_flight.insert(self.next_id, payload.clone());
                Delivery {
                    id: self.next_id,
                    payload,
                }
            })
            .collect()
    }

    /// Moves the given in-flight messages back to the queue head, keeping order.
    fn requeue(&mut self, ids: Vec<u64>) {
        let payloads: Vec<Vec<u8>> = ids
            .into_iter()
            .filter_map(|id| self.in_flight.remove(&id))
            .collect();
        if payloads.is_empty() {
            return;
        }
        let mut queues = lock(&self.shared);
        if let Some(queue) = queues.get_mut(&self.queue) {
            queue.unacked = queue.unacked.saturating_sub(payloads.len() as u64);
            for payload in payloads.into_iter().rev() {
                queue.ready.push_front(payload);
            }
        }
        drop(queues);
        self.shared.notify.notify_waiters();
    }

    fn settle(&mut self, deliveries: &[Delivery]) {
        let removed = deliveries
            .iter()
            .filter(|d| self.in_flight.remove(&d.id).is_some())
            .count();
        if let Some(queue) = lock(&self.shared).get_mut(&self.queue) {
            queue.unacked = queue.unacked.saturating_sub(removed as u64);
        }
    }

    fn unsubscribe(&mut self) {
        let ids: Vec<u64> = self.in_flight.keys().copied().collect();
        self.requeue(ids);
        if let Some(queue) = lock(&self.shared).get_mut(&self.queue) {
            queue.consumers.remove(&self.tag);
        }
    }
}

#[async_trait::async_trait]
impl QueueConsumer for MemoryQueueConsumer {
    fn queue(&self) -> &str {
        &self.queue
    }

    async fn fetch(&mut self, max: usize, wait: Duration) -> anyhow::Result<Vec<Delivery>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let shared = Arc::clone(&self.shared);
            let notified = shared.notify.notified();
            let deliveries = self.take_ready(max);
            if !deliveries.is_empty() {
                return Ok(deliveries);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(vec![]);
            }
        }
    }

    async fn ack(&mut self, deliveries: &[Delivery]) -> anyhow::Result<()> {
        self.settle(deliveries);
        Ok(())
    }

    async fn reject(&mut self, deliveries: &[Delivery], requeue: bool) -> anyhow::Result<()> {
        if requeue {
            self.requeue(deliveries.iter().map(|d| d.id).collect());
        } else {
            self.settle(deliveries);
        }
        Ok(())
    }

    async fn cancel(mut self: Box<Self>) -> anyhow::Result<()> {
        self.unsubscribe();
        Ok(())
    }
}

impl Drop for MemoryQueueConsumer {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
