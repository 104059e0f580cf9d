//! Throughput accounting and idle detection for the index monitor.
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::alerts::AlertKind;

pub(crate) const INDEX_MONITOR_INTERVAL: Duration = Duration::from_secs(5);
const RATE_SAMPLES: usize = 20;

/// Counters reset on every monitor tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Window {
    pushed: u64,
    live_pushed: u64,
    consumed: u64,
    live_consumed: u64,
    actions: u64,
    deltas: u64,
    indexed: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct Totals {
    pub blocks_read: u64,
    /// Catch-up blocks only, live blocks are not part of the range.
    pub blocks_consumed: u64,
    pub actions: u64,
    pub deltas: u64,
    pub indexed: u64,
    pub abis: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RangeSummary {
    pub elapsed: Duration,
    pub blocks: u64,
    pub actions: u64,
    pub deltas: u64,
    pub abis: u64,
}

/// What the master currently runs, sampled on every tick.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MonitorContext {
    pub workers: usize,
    pub readers: usize,
    pub validated_servers: usize,
    /// Seconds of inactivity before exiting, 0 disables.
    pub auto_stop: u64,
    pub mode_transition: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum MonitorAction {
    RangeCompleted(RangeSummary),
    Alert(AlertKind, String),
    NextServer,
    Exit(String),
    Fatal(String),
}

#[derive(Debug)]
pub(crate) struct Stats {
    window: Window,
    totals: Totals,
    consume_rates: VecDeque<f64>,
    range_blocks: u64,
    range_reported: bool,
    idle_count: u32,
    started_at: Instant,
    last_processed_block: u32,
    last_irreversible_block: u32,
}

impl Stats {
    pub fn new(range_blocks: u64) -> Self {
        Self {
            window: Window::default(),
            totals: Totals::default(),
            consume_rates: VecDeque::with_capacity(RATE_SAMPLES),
            range_blocks,
            range_reported: range_blocks == 0,
            idle_count: 0,
            started_at: Instant::now(),
            last_processed_block: 0,
            last_irreversible_block: 0,
        }
    }

    pub fn record_read(&mut self, live: bool) {
        if live {
            self.window.live_pushed += 1;
        } else {
            self.window.pushed += 1;
        }
        self.totals.blocks_read += 1;
    }

    pub fn record_consumed(&mut self, block_num: u32, lib: u32, live: bool) {
        if live {
            self.window.live_consumed += 1;
        } else {
            self.window.consumed += 1;
            self.totals.blocks_consumed += 1;
        }
        self.last_processed_block = self.last_processed_block.max(block_num);
        self.last_irreversible_block = self.last_irreversible_block.max(lib);
    }

    pub fn record_ds_report(&mut self, actions: u64, deltas: u64) {
        self.window.actions += actions;
        self.window.deltas += deltas;
        self.totals.actions += actions;
        self.totals.deltas += deltas;
    }

    pub fn record_indexed(&mut self, size: u64) {
        self.window.indexed += size;
        self.totals.indexed += size;
    }

    pub fn record_abi(&mut self) {
        self.totals.abis += 1;
    }

    pub fn record_lib(&mut self, block_num: u32) {
        self.last_irreversible_block = self.last_irreversible_block.max(block_num);
    }

    #[cfg(test)]
    pub fn totals(&self) -> &Totals {
        &self.totals
    }

    #[cfg(test)]
    pub fn idle_count(&self) -> u32 {
        self.idle_count
    }

    pub fn last_processed_block(&self) -> u32 {
        self.last_processed_block
    }

    pub fn last_irreversible_block(&self) -> u32 {
        self.last_irreversible_block
    }

    fn average_consume_rate(&self) -> f64 {
        if self.consume_rates.is_empty() {
            return 0.0;
        }
        self.consume_rates.iter().sum::<f64>() / self.consume_rates.len() as f64
    }

    fn eta(&self) -> Option<Duration> {
        let remaining = self.range_blocks.checked_sub(self.totals.blocks_consumed)?;
        let rate = self.average_consume_rate();
        if remaining == 0 || rate <= 0.0 {
            return None;
        }
        Some(Duration::from_secs((remaining as f64 / rate) as u64))
    }

    /// Closes the current window: logs throughput and decides what the
    /// master has to do about completion or inactivity.
    pub fn tick(&mut self, interval: Duration, context: MonitorContext) -> Vec<MonitorAction> {
        let mut actions = vec![];
        if context.workers == 0 {
            actions.push(MonitorAction::Fatal(
                "all workers have stopped".to_string(),
            ));
            return actions;
        }

        let seconds = interval.as_secs_f64().max(f64::EPSILON);
        let window = std::mem::take(&mut self.window);
        let consume_rate = window.consumed as f64 / seconds;
        if self.consume_rates.len() == RATE_SAMPLES {
            self.consume_rates.pop_front();
        }
        self.consume_rates.push_back(consume_rate);

        let pushed = window.pushed + window.live_pushed;
        let consumed = window.consumed + window.live_consumed;
        tracing::info!(
            target: crate::INDEXER,
            "W:{} | R:{:.1} | C:{:.1} | A:{:.1} | D:{:.1} | I:{:.1} | #{}{}",
            context.workers,
            pushed as f64 / seconds,
            consumed as f64 / seconds,
            window.actions as f64 / seconds,
            window.deltas as f64 / seconds,
            window.indexed as f64 / seconds,
            self.last_processed_block,
            match self.eta() {
                Some(eta) => format!(
                    " | {} to finish the range",
                    humantime::format_duration(eta)
                ),
                None => "".to_string(),
            }
        );

        let is_idle = pushed == 0 && consumed == 0 && window.indexed == 0;
        if is_idle && !self.range_reported && self.totals.blocks_consumed >= self.range_blocks {
            self.range_reported = true;
            actions.push(MonitorAction::RangeCompleted(RangeSummary {
                elapsed: self.started_at.elapsed(),
                blocks: self.totals.blocks_consumed,
                actions: self.totals.actions,
                deltas: self.totals.deltas,
                abis: self.totals.abis,
            }));
        }

        if pushed == 0 {
            self.idle_count += 1;
            if context.auto_stop > 0 {
                let idle_for = interval.as_secs() * u64::from(self.idle_count);
                if idle_for >= context.auto_stop {
                    let reason = format!("no blocks read for {} seconds", idle_for);
                    actions.push(MonitorAction::Alert(
                        AlertKind::Idle,
                        format!("Stopping, {}", reason),
                    ));
                    actions.push(MonitorAction::Fatal(reason));
                } else if self.idle_count == 1 {
                    actions.push(MonitorAction::Alert(
                        AlertKind::Idle,
                        format!(
                            "No blocks read, stopping in {} seconds",
                            context.auto_stop - idle_for
                        ),
                    ));
                }
            } else if context.readers == 0 {
                if is_idle && !context.mode_transition {
                    let range_done = self.totals.blocks_consumed >= self.range_blocks;
                    let reason = if range_done {
                        "no readers left and the pipeline is drained".to_string()
                    } else {
                        format!(
                            "no readers left with {} of {} blocks consumed",
                            self.totals.blocks_consumed, self.range_blocks
                        )
                    };
                    actions.push(MonitorAction::Alert(
                        AlertKind::Idle,
                        format!("Stopping, {}", reason),
                    ));
                    actions.push(if range_done {
                        MonitorAction::Exit(reason)
                    } else {
                        MonitorAction::Fatal(reason)
                    });
                }
            } else {
                if self.idle_count == 2 && !context.mode_transition {
                    actions.push(MonitorAction::Alert(
                        AlertKind::Idle,
                        format!(
                            "No blocks are being read, last processed block #{}",
                            self.last_processed_block
                        ),
                    ));
                }
                if self.idle_count == 3 && context.validated_servers > 1 {
                    actions.push(MonitorAction::NextServer);
                }
            }
        } else {
            if self.idle_count > 1 {
                actions.push(MonitorAction::Alert(
                    AlertKind::Resumed,
                    format!(
                        "Block reading resumed after {} idle checks",
                        self.idle_count
                    ),
                ));
            }
            self.idle_count = 0;
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(readers: usize, validated_servers: usize, auto_stop: u64) -> MonitorContext {
        MonitorContext {
            workers: 4,
            readers,
            validated_servers,
            auto_stop,
            mode_transition: false,
        }
    }

    #[test]
    fn range_completion_is_reported_once() {
        let mut stats = Stats::new(2);
        stats.record_read(false);
        stats.record_read(false);
        stats.record_consumed(10, 5, false);
        stats.record_consumed(11, 5, false);
        stats.record_ds_report(7, 3);
        stats.record_abi();
        assert!(stats.tick(INDEX_MONITOR_INTERVAL, context(1, 1, 0)).is_empty());

        let actions = stats.tick(INDEX_MONITOR_INTERVAL, context(1, 1, 0));
        let Some(MonitorAction::RangeCompleted(summary)) = actions.first() else {
            panic!("expected a range summary, got {:?}", actions);
        };
        assert_eq!((summary.blocks, summary.actions, summary.deltas, summary.abis), (2, 7, 3, 1));
        assert!(!stats
            .tick(INDEX_MONITOR_INTERVAL, context(1, 1, 0))
            .iter()
            .any(|action| matches!(action, MonitorAction::RangeCompleted(_))));
        assert_eq!(stats.last_processed_block(), 11);
    }

    #[test]
    fn idle_escalates_to_alert_then_next_server() {
        let mut stats = Stats::new(0);
        assert!(stats.tick(INDEX_MONITOR_INTERVAL, context(1, 2, 0)).is_empty());
        assert!(matches!(
            stats.tick(INDEX_MONITOR_INTERVAL, context(1, 2, 0)).as_slice(),
            [MonitorAction::Alert(AlertKind::Idle, _)]
        ));
        assert_eq!(
            stats.tick(INDEX_MONITOR_INTERVAL, context(1, 2, 0)),
            vec![MonitorAction::NextServer]
        );

        stats.record_read(true);
        assert!(matches!(
            stats.tick(INDEX_MONITOR_INTERVAL, context(1, 2, 0)).as_slice(),
            [MonitorAction::Alert(AlertKind::Resumed, _)]
        ));
        assert_eq!(stats.idle_count(), 0);
    }

    #[test]
    fn auto_stop_exits_after_the_configured_time() {
        let mut stats = Stats::new(0);
        assert!(matches!(
            stats.tick(INDEX_MONITOR_INTERVAL, context(1, 1, 15)).as_slice(),
            [MonitorAction::Alert(AlertKind::Idle, message)] if message.contains("10 seconds")
        ));
        assert!(stats.tick(INDEX_MONITOR_INTERVAL, context(1, 1, 15)).is_empty());
        assert!(matches!(
            stats.tick(INDEX_MONITOR_INTERVAL, context(1, 1, 15)).as_slice(),
            [MonitorAction::Alert(AlertKind::Idle, _), MonitorAction::Fatal(_)]
        ));
    }

    #[test]
    fn drained_pipeline_without_readers_exits() {
        let mut stats = Stats::new(0);
        stats.record_indexed(40);
        assert!(stats.tick(INDEX_MONITOR_INTERVAL, context(0, 1, 0)).is_empty());
        assert!(matches!(
            stats.tick(INDEX_MONITOR_INTERVAL, context(0, 1, 0)).as_slice(),
            [MonitorAction::Alert(AlertKind::Idle, _), MonitorAction::Exit(_)]
        ));
    }

    #[test]
    fn readers_gone_before_the_range_completed_is_fatal() {
        let mut stats = Stats::new(100);
        stats.record_consumed(40, 30, false);
        assert!(stats.tick(INDEX_MONITOR_INTERVAL, context(0, 1, 0)).is_empty());
        let actions = stats.tick(INDEX_MONITOR_INTERVAL, context(0, 1, 0));
        assert!(matches!(
            actions.as_slice(),
            [MonitorAction::Alert(AlertKind::Idle, _), MonitorAction::Fatal(message)] if message.contains("1 of 100")
        ));
    }

    #[test]
    fn no_workers_is_fatal() {
        let mut stats = Stats::new(0);
        let mut context = context(1, 1, 0);
        context.workers = 0;
        assert!(matches!(
            stats.tick(INDEX_MONITOR_INTERVAL, context).as_slice(),
            [MonitorAction::Fatal(_)]
        ));
    }
}
