use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    Idle,
    Resumed,
    RangeCompleted,
    ModeSwitch,
    Fork,
    WorkerCrash,
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            AlertKind::Idle => "idle",
            AlertKind::Resumed => "resumed",
            AlertKind::RangeCompleted => "range_completed",
            AlertKind::ModeSwitch => "mode_switch",
            AlertKind::Fork => "fork",
            AlertKind::WorkerCrash => "worker_crash",
        };
        f.write_str(kind)
    }
}

/// Delivery channel for operator alerts.
pub trait Alert: Send + Sync {
    fn emit(&self, kind: AlertKind, message: &str);
}

/// Default channel: alerts end up as warn-level log events.
#[derive(Debug, Default, Clone)]
pub struct TracingAlerts;

impl Alert for TracingAlerts {
    fn emit(&self, kind: AlertKind, message: &str) {
        tracing::warn!(target: crate::INDEXER, alert = %kind, "{}", message);
    }
}

pub(crate) fn default_alerts() -> Arc<dyn Alert> {
    Arc::new(TracingAlerts)
}
