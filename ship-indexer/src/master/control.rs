//! Operator control of the ingestors: pause, resume and stop, each answered
//! by every targeted worker under a shared operation id.
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use ship_primitives::{new_operation_id, RecordKind};
use tokio::sync::{mpsc, oneshot};

pub(crate) const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("operation {m_id} was not acknowledged within {timeout:?}")]
    Timeout { m_id: String, timeout: Duration },
    #[error("the master is not accepting control requests")]
    Unreachable,
    #[error("operation rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlOperation {
    Pause(Option<RecordKind>),
    Resume(Option<RecordKind>),
    Stop,
}

pub(crate) type ControlReply = oneshot::Sender<Result<usize, ControlError>>;

pub(crate) struct ControlRequest {
    pub operation: ControlOperation,
    pub m_id: String,
    pub reply: ControlReply,
}

/// Cloneable entry point used by the HTTP control routes.
#[derive(Clone)]
pub struct ControlHandle {
    requests: mpsc::UnboundedSender<ControlRequest>,
    timeout: Duration,
}

impl ControlHandle {
    pub(crate) fn new(timeout: Duration) -> (Self, mpsc::UnboundedReceiver<ControlRequest>) {
        let (requests, receiver) = mpsc::unbounded_channel();
        (Self { requests, timeout }, receiver)
    }

    /// Resolves to the number of ingestors that acknowledged.
    pub async fn pause_indexer(&self, kind: Option<RecordKind>) -> Result<usize, ControlError> {
        self.request(ControlOperation::Pause(kind)).await
    }

    pub async fn resume_indexer(&self, kind: Option<RecordKind>) -> Result<usize, ControlError> {
        self.request(ControlOperation::Resume(kind)).await
    }

    pub async fn stop_indexer(&self) -> Result<usize, ControlError> {
        self.request(ControlOperation::Stop).await
    }

    async fn request(&self, operation: ControlOperation) -> Result<usize, ControlError> {
        let (reply, response) = oneshot::channel();
        let m_id = new_operation_id();
        self.requests
            .send(ControlRequest {
                operation,
                m_id: m_id.clone(),
                reply,
            })
            .map_err(|_| ControlError::Unreachable)?;
        match tokio::time::timeout(self.timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ControlError::Unreachable),
            Err(_) => {
                tracing::warn!(
                    target: crate::INDEXER,
                    "Control operation {:?} [{}] timed out",
                    operation,
                    m_id
                );
                Err(ControlError::Timeout {
                    m_id,
                    timeout: self.timeout,
                })
            }
        }
    }
}

struct PendingControl {
    awaiting: HashSet<usize>,
    acknowledged: usize,
    reply: ControlReply,
}

/// Operations sent to workers and still waiting for acknowledgements.
#[derive(Default)]
pub(crate) struct PendingControls {
    operations: HashMap<String, PendingControl>,
}

impl PendingControls {
    pub fn register(&mut self, m_id: String, workers: HashSet<usize>, reply: ControlReply) {
        if workers.is_empty() {
            let _ = reply.send(Err(ControlError::Rejected(
                "no running ingestor matches the request".to_string(),
            )));
            return;
        }
        self.operations.insert(
            m_id,
            PendingControl {
                awaiting: workers,
                acknowledged: 0,
                reply,
            },
        );
    }

    pub fn acknowledge(&mut self, m_id: &str, worker_id: usize) {
        let Some(pending) = self.operations.get_mut(m_id) else {
            tracing::debug!(target: crate::INDEXER, "Late acknowledgement of {}", m_id);
            return;
        };
        if pending.awaiting.remove(&worker_id) {
            pending.acknowledged += 1;
        }
        if pending.awaiting.is_empty() {
            if let Some(pending) = self.operations.remove(m_id) {
                let _ = pending.reply.send(Ok(pending.acknowledged));
            }
        }
    }

    /// A worker that exits can no longer answer the operations it was part of.
    pub fn forget_worker(&mut self, worker_id: usize) {
        let failed: Vec<String> = self
            .operations
            .iter()
            .filter(|(_, pending)| pending.awaiting.contains(&worker_id))
            .map(|(m_id, _)| m_id.clone())
            .collect();
        for m_id in failed {
            if let Some(pending) = self.operations.remove(&m_id) {
                let _ = pending.reply.send(Err(ControlError::Rejected(format!(
                    "worker {} exited before acknowledging",
                    worker_id
                ))));
            }
        }
    }

    /// Drops operations whose caller already gave up.
    pub fn prune(&mut self) {
        self.operations.retain(|_, pending| !pending.reply.is_closed());
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.operations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn operation_completes_after_every_ack() {
        let mut pending = PendingControls::default();
        let (reply, response) = oneshot::channel();
        pending.register("m1".to_string(), HashSet::from([3, 4]), reply);
        pending.acknowledge("m1", 3);
        pending.acknowledge("m1", 3);
        assert_eq!(pending.len(), 1);
        pending.acknowledge("m1", 4);
        assert_eq!(pending.len(), 0);
        assert_eq!(response.await.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn empty_target_is_rejected() {
        let mut pending = PendingControls::default();
        let (reply, response) = oneshot::channel();
        pending.register("m1".to_string(), HashSet::new(), reply);
        assert!(matches!(response.await.unwrap(), Err(ControlError::Rejected(_))));
    }

    #[tokio::test]
    async fn exited_worker_fails_the_operation() {
        let mut pending = PendingControls::default();
        let (reply, response) = oneshot::channel();
        pending.register("m1".to_string(), HashSet::from([7]), reply);
        pending.forget_worker(7);
        assert!(matches!(response.await.unwrap(), Err(ControlError::Rejected(_))));
    }

    #[tokio::test]
    async fn unanswered_request_times_out() {
        let (handle, mut requests) = ControlHandle::new(Duration::from_millis(20));
        let caller = tokio::spawn(async move { handle.pause_indexer(None).await });
        let request = requests.recv().await.unwrap();
        assert_eq!(request.operation, ControlOperation::Pause(None));
        assert!(matches!(
            caller.await.unwrap(),
            Err(ControlError::Timeout { .. })
        ));
        let mut pending = PendingControls::default();
        pending.register(request.m_id, HashSet::from([1]), request.reply);
        pending.prune();
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn stopped_master_is_unreachable() {
        let (handle, requests) = ControlHandle::new(Duration::from_millis(20));
        drop(requests);
        assert!(matches!(handle.stop_indexer().await, Err(ControlError::Unreachable)));
    }
}
