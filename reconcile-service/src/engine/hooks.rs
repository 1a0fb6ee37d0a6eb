//! Extension points around reconciliation. Every hook has a no-op default.

use std::{collections::HashSet, sync::Arc};

use network_client::domain::{Alert, Pulse, PulseKey};

/// Labels pulses of a finished day.
#[async_trait::async_trait]
pub trait AnomalyDetector: Send + Sync {
    /// Flags for some or all of `pulses`, which cover one meter and one day.
    async fn detect(&self, meter_id: &str, pulses: &[Pulse]) -> Vec<(PulseKey, bool)>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoAnomalyDetector;

#[async_trait::async_trait]
impl AnomalyDetector for NoAnomalyDetector {
    async fn detect(&self, _meter_id: &str, _pulses: &[Pulse]) -> Vec<(PulseKey, bool)> {
        Vec::new()
    }
}

/// Meters whose pulses are stored but never reconciled.
pub trait IgnoreSet: Send + Sync {
    fn is_ignored(&self, meter_id: &str) -> bool;
}

#[derive(Debug, Clone, Default)]
pub struct StaticIgnoreSet {
    meters: HashSet<String>,
}

impl StaticIgnoreSet {
    pub fn new<I, S>(meters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            meters: meters.into_iter().map(Into::into).collect(),
        }
    }
}

impl IgnoreSet for StaticIgnoreSet {
    fn is_ignored(&self, meter_id: &str) -> bool {
        self.meters.contains(meter_id)
    }
}

/// Delivers leak alerts to subscribers.
#[async_trait::async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, subscriber: &str, alert: &Alert) -> anyhow::Result<()>;
}

/// Writes alerts to the log only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotificationSink;

#[async_trait::async_trait]
impl NotificationSink for LogNotificationSink {
    async fn notify(&self, subscriber: &str, alert: &Alert) -> anyhow::Result<()> {
        tracing::info!(
            subscriber,
            alert = %alert.key,
            zone = %alert.zone_id,
            night = %alert.night,
            loss = alert.loss_amount,
            "leak alert"
        );
        Ok(())
    }
}

#[derive(Clone)]
pub struct Hooks {
    pub anomaly: Arc<dyn AnomalyDetector>,
    pub ignore: Arc<dyn IgnoreSet>,
    pub notifications: Arc<dyn NotificationSink>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            anomaly: Arc::new(NoAnomalyDetector),
            ignore: Arc::new(StaticIgnoreSet::default()),
            notifications: Arc::new(LogNotificationSink),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_ignore_set_matches_exact_ids() {
        let set = StaticIgnoreSet::new(["mtr-9"]);
        assert!(set.is_ignored("mtr-9"));
        assert!(!set.is_ignored("mtr-90"));
    }
}
