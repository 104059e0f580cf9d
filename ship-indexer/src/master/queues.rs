//! Backpressure and autoscaling decisions taken on every queue monitor tick.
use configuration::QueueLimits;
use queue_fabric::QueueInfo;
use ship_primitives::{QueueDescriptor, QueueNames};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Backpressure {
    Pause,
    Resume,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueueDecision {
    pub backpressure: Backpressure,
    /// Ingestor queues that get one extra consumer this tick.
    pub scale_up: Vec<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct QueueMonitor {
    limits: QueueLimits,
    auto_scale_trigger: u64,
    max_autoscale: usize,
    readers_paused: bool,
}

impl QueueMonitor {
    pub fn new(limits: QueueLimits, auto_scale_trigger: u64, max_autoscale: usize) -> Self {
        Self {
            limits,
            auto_scale_trigger,
            max_autoscale,
            readers_paused: false,
        }
    }

    pub fn readers_paused(&self) -> bool {
        self.readers_paused
    }

    /// Forgets the paused state, used when all workers are relaunched.
    pub fn reset(&mut self) {
        self.readers_paused = false;
    }

    /// Attaches the thresholds that apply to `info`. Stage-1 queues use the
    /// block limit and never autoscale. `consumers` is the number of
    /// workers the master runs on the queue.
    pub fn describe(&self, names: &QueueNames, info: QueueInfo, consumers: u64) -> QueueDescriptor {
        let is_block_queue = names.is_block_queue(&info.name);
        QueueDescriptor {
            name: info.name,
            depth: info.messages,
            consumers,
            limit: if is_block_queue {
                self.limits.block_queue_limit
            } else {
                self.limits.max_queue_limit
            },
            resume_trigger: self.limits.resume_trigger,
            autoscale_trigger: (!is_block_queue).then_some(self.auto_scale_trigger),
        }
    }

    /// Readers pause as soon as one queue reaches its limit and resume only
    /// once every queue has drained below the resume trigger.
    pub fn evaluate(&mut self, queues: &[QueueDescriptor]) -> QueueDecision {
        let above_limit = queues.iter().any(QueueDescriptor::is_above_limit);
        let can_resume = queues.iter().all(QueueDescriptor::allows_resume);

        let backpressure = if above_limit {
            if self.readers_paused {
                Backpressure::Unchanged
            } else {
                self.readers_paused = true;
                Backpressure::Pause
            }
        } else if self.readers_paused && can_resume {
            self.readers_paused = false;
            Backpressure::Resume
        } else {
            Backpressure::Unchanged
        };

        let scale_up = queues
            .iter()
            .filter(|queue| queue.needs_more_consumers())
            .filter(|queue| queue.consumers < self.max_autoscale as u64)
            .map(|queue| queue.name.clone())
            .collect();

        QueueDecision {
            backpressure,
            scale_up,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> QueueMonitor {
        QueueMonitor::new(
            QueueLimits {
                max_queue_limit: 10_000,
                block_queue_limit: 2_000,
                resume_trigger: 5_000,
            },
            1_000,
            3,
        )
    }

    fn info(name: &str, messages: u64) -> QueueInfo {
        QueueInfo {
            name: name.to_string(),
            messages,
            consumers: 0,
        }
    }

    #[test]
    fn block_queues_use_their_own_limit() {
        let names = QueueNames::new("wax");
        let monitor = monitor();
        let block = monitor.describe(&names, info("wax:blocks:1", 2_000), 1);
        assert!(block.is_above_limit());
        assert_eq!(block.autoscale_trigger, None);
        let actions = monitor.describe(&names, info("wax:index_actions:1", 2_000), 1);
        assert!(!actions.is_above_limit());
        assert_eq!(actions.autoscale_trigger, Some(1_000));
    }

    #[test]
    fn pause_and_resume_follow_hysteresis() {
        let names = QueueNames::new("wax");
        let mut monitor = monitor();
        let tick = |monitor: &mut QueueMonitor, depth: u64| {
            let queue = monitor.describe(&names, info("wax:index_blocks:1", depth), 3);
            monitor.evaluate(&[queue]).backpressure
        };

        assert_eq!(tick(&mut monitor, 10_000), Backpressure::Pause);
        assert_eq!(tick(&mut monitor, 12_000), Backpressure::Unchanged);
        // between the resume trigger and the limit nothing changes
        assert_eq!(tick(&mut monitor, 7_000), Backpressure::Unchanged);
        assert!(monitor.readers_paused());
        assert_eq!(tick(&mut monitor, 5_000), Backpressure::Resume);
        assert_eq!(tick(&mut monitor, 4_000), Backpressure::Unchanged);
        assert!(!monitor.readers_paused());
    }

    #[test]
    fn resume_needs_every_queue_drained() {
        let names = QueueNames::new("wax");
        let mut monitor = monitor();
        let full = monitor.describe(&names, info("wax:blocks:1", 3_000), 1);
        assert_eq!(monitor.evaluate(&[full]).backpressure, Backpressure::Pause);

        let drained = monitor.describe(&names, info("wax:blocks:1", 100), 1);
        let busy = monitor.describe(&names, info("wax:index_deltas:1", 6_000), 3);
        assert_eq!(
            monitor.evaluate(&[drained.clone(), busy]).backpressure,
            Backpressure::Unchanged
        );
        assert_eq!(monitor.evaluate(&[drained]).backpressure, Backpressure::Resume);
    }

    #[test]
    fn autoscale_stops_at_the_cap() {
        let names = QueueNames::new("wax");
        let mut monitor = monitor();
        let mut consumers = 1;
        for _ in 0..10 {
            let queue = monitor.describe(&names, info("wax:index_actions:1", 5_000), consumers);
            consumers += monitor.evaluate(&[queue]).scale_up.len() as u64;
        }
        assert_eq!(consumers, 3);
    }
}
