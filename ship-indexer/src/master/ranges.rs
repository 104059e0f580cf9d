use ship_primitives::BlockRange;

/// Blocks the catch-up readers have to cover, `[starting_block, head)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IndexingRange {
    pub starting_block: u32,
    pub head: u32,
}

fn block_height(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

/// Picks where indexing starts and where the catch-up phase ends.
///
/// `trace_begin` is the lowest first traced block among the validated
/// history servers; nothing below it can be served.
pub(crate) fn find_range(
    indexer_config: &configuration::IndexerConfig,
    last_indexed: Option<u32>,
    trace_begin: Option<u32>,
    chain_head: u32,
) -> IndexingRange {
    let last_indexed = last_indexed.unwrap_or_default();
    let mut starting_block = if last_indexed > 0 { last_indexed } else { 1 };

    if indexer_config.start_on != 0 {
        starting_block = block_height(indexer_config.start_on);
        if !indexer_config.rewrite && last_indexed > starting_block {
            tracing::warn!(
                target: crate::INDEXER,
                "Data present on target range, resuming from block {} instead of {}. \
                 Enable indexer.rewrite to reindex it",
                last_indexed,
                starting_block
            );
            starting_block = last_indexed;
        }
    }

    if let Some(trace_begin) = trace_begin.filter(|block| *block > 0) {
        if starting_block < trace_begin {
            tracing::info!(
                target: crate::INDEXER,
                "First traced block is {}, skipping {} blocks",
                trace_begin,
                trace_begin - starting_block
            );
            starting_block = trace_begin;
        }
    }

    let head = if indexer_config.stop_on != 0 {
        block_height(indexer_config.stop_on)
    } else {
        chain_head
    };

    IndexingRange {
        starting_block,
        head,
    }
}

/// Hands out consecutive batches of `[starting_block, head)` to readers.
#[derive(Debug, Clone)]
pub(crate) struct RangeAllocator {
    last_assigned: u32,
    head: u32,
    batch_size: u32,
}

impl RangeAllocator {
    pub fn new(range: IndexingRange, batch_size: u64) -> Self {
        Self {
            last_assigned: range.starting_block,
            head: range.head,
            batch_size: block_height(batch_size).max(1),
        }
    }

    pub fn next_range(&mut self) -> Option<BlockRange> {
        if self.is_exhausted() {
            return None;
        }
        let last = self.last_assigned.saturating_add(self.batch_size).min(self.head);
        let range = BlockRange::new(self.last_assigned, last);
        self.last_assigned = last;
        Some(range)
    }

    /// A reader found its range starting later than assigned and moved the
    /// frontier forward itself.
    pub fn advance_to(&mut self, block_num: u32) {
        if block_num > self.last_assigned {
            self.last_assigned = block_num.min(self.head);
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.last_assigned >= self.head
    }

    #[cfg(test)]
    pub fn last_assigned(&self) -> u32 {
        self.last_assigned
    }

    pub fn head(&self) -> u32 {
        self.head
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn indexer_config(start_on: u64, stop_on: u64, rewrite: bool) -> configuration::IndexerConfig {
        let mut config = configuration::parse_configuration(
            r#"
            [general]
            chain = "wax"
            chain_api = "http://127.0.0.1:8888"
            "#,
        )
        .unwrap()
        .indexer;
        config.start_on = start_on;
        config.stop_on = stop_on;
        config.rewrite = rewrite;
        config
    }

    #[test]
    fn fresh_storage_starts_at_one() {
        let range = find_range(&indexer_config(0, 0, false), None, None, 5000);
        assert_eq!(
            range,
            IndexingRange {
                starting_block: 1,
                head: 5000
            }
        );
    }

    #[test]
    fn resumes_from_last_indexed_block() {
        let range = find_range(&indexer_config(0, 0, false), Some(1200), None, 5000);
        assert_eq!(range.starting_block, 1200);
    }

    #[test]
    fn start_on_keeps_existing_data_unless_rewriting() {
        let range = find_range(&indexer_config(100, 0, false), Some(1200), None, 5000);
        assert_eq!(range.starting_block, 1200);
        let range = find_range(&indexer_config(100, 0, true), Some(1200), None, 5000);
        assert_eq!(range.starting_block, 100);
    }

    #[test]
    fn clamps_to_first_traced_block_and_stop_on() {
        let range = find_range(&indexer_config(0, 3000, false), None, Some(700), 5000);
        assert_eq!(
            range,
            IndexingRange {
                starting_block: 700,
                head: 3000
            }
        );
    }

    #[test]
    fn allocator_hands_out_batches_until_head() {
        let mut allocator = RangeAllocator::new(
            IndexingRange {
                starting_block: 10,
                head: 35,
            },
            10,
        );
        assert_eq!(allocator.next_range(), Some(BlockRange::new(10, 20)));
        allocator.advance_to(25);
        assert_eq!(allocator.next_range(), Some(BlockRange::new(25, 35)));
        assert!(allocator.is_exhausted());
        assert_eq!(allocator.next_range(), None);
        allocator.advance_to(100);
        assert_eq!(allocator.last_assigned(), 35);
    }
}
