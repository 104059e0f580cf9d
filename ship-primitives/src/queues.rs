use serde::{Deserialize, Serialize};

use crate::records::RecordKind;

/// Builds the queue names shared by every stage for one chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    chain: String,
}

impl QueueNames {
    pub fn new(chain: impl Into<String>) -> Self {
        Self {
            chain: chain.into(),
        }
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    /// Stage-1 queue fed by range readers, `index` starts at 1.
    pub fn blocks(&self, index: usize) -> String {
        format!("{}:blocks:{}", self.chain, index)
    }

    pub fn live_blocks(&self) -> String {
        format!("{}:live_blocks", self.chain)
    }

    pub fn index(&self, kind: RecordKind, index: usize) -> String {
        format!("{}:{}:{}", self.chain, kind.queue_fragment(), index)
    }

    pub fn is_block_queue(&self, queue: &str) -> bool {
        queue == self.live_blocks() || queue.starts_with(&format!("{}:blocks:", self.chain))
    }

    /// Record kind carried by an indexing queue name.
    pub fn kind_of(&self, queue: &str) -> Option<RecordKind> {
        let rest = queue.strip_prefix(&self.chain)?.strip_prefix(':')?;
        let (fragment, _) = rest.split_once(':')?;
        RecordKind::from_queue_fragment(fragment)
    }
}

/// Depth snapshot of a broker queue plus the thresholds the master applies.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct QueueDescriptor {
    pub name: String,
    pub depth: u64,
    pub consumers: u64,
    pub limit: u64,
    pub resume_trigger: u64,
    #[serde(default)]
    pub autoscale_trigger: Option<u64>,
}

impl QueueDescriptor {
    pub fn is_above_limit(&self) -> bool {
        self.depth >= self.limit
    }

    pub fn allows_resume(&self) -> bool {
        self.depth <= self.resume_trigger
    }

    pub fn needs_more_consumers(&self) -> bool {
        matches!(self.autoscale_trigger, Some(trigger) if self.depth > trigger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_and_kinds() {
        let names = QueueNames::new("wax");
        assert_eq!(names.blocks(2), "wax:blocks:2");
        assert_eq!(names.live_blocks(), "wax:live_blocks");
        assert_eq!(names.index(RecordKind::Action, 3), "wax:index_actions:3");
        assert_eq!(names.kind_of("wax:index_deltas:1"), Some(RecordKind::Delta));
        assert_eq!(names.kind_of("wax:blocks:1"), None);
        assert!(names.is_block_queue("wax:blocks:4"));
        assert!(names.is_block_queue("wax:live_blocks"));
        assert!(!names.is_block_queue("wax:index_blocks:1"));
    }
}
