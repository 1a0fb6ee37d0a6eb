//! Pulse reconciliation engine.
//!
//! Every reading is handled as one unit of work: the pulse is stored, the
//! pending records of the zones and lines it borders are matched, completed
//! windows are settled into rollups, and the whole changeset is committed at
//! once. Units touching the same target are serialized by [`TargetLocks`].

pub mod averager;
pub mod barrier;
pub mod error;
pub mod hooks;
pub mod keys;
pub mod leak;
pub mod line;
pub mod locks;
pub mod normalizer;
pub mod rollup;
pub mod ticks;
pub mod unit_of_work;
pub mod zone;

use std::sync::Arc;

use network_client::{
    db::{Change, Changeset, EntityStore},
    domain::{Network, Pulse, PulseKey, Resolution, RollupKey, RollupRow, Series, Target},
};
use serde::Serialize;
use time::{macros::time, Date, Duration, OffsetDateTime, Time};

use crate::config::ReconcileConfig;

pub use error::EngineError;
pub use hooks::{AnomalyDetector, Hooks, IgnoreSet, NotificationSink, StaticIgnoreSet};
pub use leak::NightlyLeak;
pub use locks::TargetLocks;
pub use rollup::ReconciledWindow;

use unit_of_work::UnitOfWork;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Gaps older than this are reset to zero instead of distributed.
    pub gap_reset_after: Duration,
    /// How far a zone may run ahead of a pending record before the record's
    /// missing pulses are treated as lost.
    pub late_tolerance: Duration,
    pub mnf_start: Time,
    pub mnf_end: Time,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            gap_reset_after: Duration::hours(48),
            late_tolerance: ticks::RIE * 4,
            mnf_start: time!(2:00),
            mnf_end: time!(4:00),
        }
    }
}

impl EngineSettings {
    pub fn from_config(cfg: &ReconcileConfig) -> anyhow::Result<Self> {
        let (mnf_start, mnf_end) = cfg.mnf.window()?;
        Ok(Self {
            gap_reset_after: Duration::hours(cfg.gap_reset_after_hours),
            late_tolerance: ticks::RIE * cfg.late_tolerance_ticks,
            mnf_start,
            mnf_end,
        })
    }
}

/// A zone whose day just closed and whose leak estimate can be scheduled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NightlyDue {
    pub zone_id: String,
    pub night: Date,
}

#[derive(Debug, Clone, Serialize)]
pub struct PulseReceipt {
    pub pulse: Pulse,
    /// Meter is in the ignore set; the pulse was stored only.
    pub ignored: bool,
    pub windows: Vec<ReconciledWindow>,
    pub nightly_due: Vec<NightlyDue>,
}

/// What a unit of work settled, reported after commit.
#[derive(Debug, Default)]
pub(crate) struct Outcome {
    pub windows: Vec<ReconciledWindow>,
    pub nightly_due: Vec<NightlyDue>,
}

impl Outcome {
    pub fn window(&mut self, w: Option<ReconciledWindow>) {
        if let Some(w) = w {
            self.windows.push(w);
        }
    }
}

pub struct Engine {
    store: Arc<dyn EntityStore>,
    network: Arc<Network>,
    settings: EngineSettings,
    locks: TargetLocks,
    hooks: Hooks,
}

impl Engine {
    pub fn new(store: Arc<dyn EntityStore>, network: Arc<Network>, settings: EngineSettings) -> Self {
        Self {
            store,
            network,
            settings,
            locks: TargetLocks::new(),
            hooks: Hooks::default(),
        }
    }

    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn store(&self) -> &dyn EntityStore {
        self.store.as_ref()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Store a flow meter pulse and reconcile every zone and line it borders.
    pub async fn record_pulse(
        &self,
        meter_id: &str,
        ts: OffsetDateTime,
        raw: &str,
    ) -> Result<PulseReceipt, EngineError> {
        let meter = self
            .network
            .meter(meter_id)
            .ok_or_else(|| EngineError::UnknownDevice(meter_id.to_string()))?;
        let ts = ticks::truncate_to_minute(ts);
        if !ticks::is_aligned(ts) {
            return Err(EngineError::InvalidReading(format!(
                "pulse {meter_id}@{ts} is not on the 15-minute grid"
            )));
        }
        let pulse = normalizer::build_pulse(meter_id, ts, raw, &meter.calibration)?;
        let ignored = self.hooks.ignore.is_ignored(meter_id);

        let targets: Vec<Target> = if ignored {
            Vec::new()
        } else {
            meter
                .zones()
                .map(|z| Target::Zone(z.clone()))
                .chain(meter.lines().map(|l| Target::Line(l.clone())))
                .collect()
        };

        let outcome = {
            let _guards = self.locks.lock_all(&targets).await;
            let mut uow = UnitOfWork::new(self.store.as_ref());

            if let Some(existing) = uow.pulse(meter_id, ts).await? {
                if existing.fingerprint == pulse.fingerprint {
                    metrics::counter!("reconcile_duplicate_pulses_total").increment(1);
                    return Err(EngineError::DuplicatePulse {
                        meter_id: meter_id.to_string(),
                        ts,
                    });
                }
                return Err(EngineError::ConflictingPulse {
                    meter_id: meter_id.to_string(),
                    ts,
                });
            }

            uow.insert_pulse(pulse.clone());
            let mut out = Outcome::default();
            if !ignored {
                for zone_id in meter.zones() {
                    self.reconcile_zone(&mut uow, zone_id, &pulse, &mut out).await?;
                }
                for line_id in meter.lines() {
                    self.reconcile_line(&mut uow, line_id, &pulse, &mut out).await?;
                }
            }

            self.store.commit(uow.finish()).await?;
            out
        };

        metrics::counter!("reconcile_pulses_recorded_total").increment(1);
        metrics::counter!("reconcile_windows_settled_total").increment(outcome.windows.len() as u64);
        tracing::debug!(
            meter = %meter_id,
            %ts,
            ignored,
            windows = outcome.windows.len(),
            "pulse recorded"
        );

        if ts.hour() == 0 && ts.minute() == 30 {
            let day = (ts - Duration::days(1)).date();
            if let Err(e) = self.label_anomalies(meter_id, day).await {
                tracing::warn!(meter = %meter_id, %day, error = %e, "anomaly labelling failed");
            }
        }

        Ok(PulseReceipt {
            pulse,
            ignored,
            windows: outcome.windows,
            nightly_due: outcome.nightly_due,
        })
    }

    /// Run the anomaly detector over one meter's pulses of `day`.
    pub async fn label_anomalies(&self, meter_id: &str, day: Date) -> Result<usize, EngineError> {
        let from = ticks::day_start(day);
        let pulses = self
            .store
            .pulses_between(meter_id, from, from + Duration::days(1))
            .await?;
        if pulses.is_empty() {
            return Ok(0);
        }

        let flags = self.hooks.anomaly.detect(meter_id, &pulses).await;
        let mut changes = Changeset::new();
        changes.extend(
            flags
                .into_iter()
                .map(|(key, anomaly)| Change::SetAnomaly { key, anomaly }),
        );
        let n = changes.len();
        if n > 0 {
            self.store.commit(changes).await?;
        }
        Ok(n)
    }

    pub async fn flag_anomaly(&self, key: PulseKey, anomaly: bool) -> Result<(), EngineError> {
        let mut changes = Changeset::new();
        changes.push(Change::SetAnomaly { key, anomaly });
        self.store.commit(changes).await?;
        Ok(())
    }

    /// Value of the aggregate at `resolution` whose period contains `at`.
    ///
    /// A quarter-hour row written without a baseline exists with no value.
    pub async fn get_aggregate(
        &self,
        series: Series,
        target_id: &str,
        resolution: Resolution,
        at: OffsetDateTime,
    ) -> Result<Option<f64>, EngineError> {
        if !series.supports(resolution) {
            return Err(EngineError::UnsupportedResolution { series, resolution });
        }
        let key = RollupKey::containing(series, target_id, resolution, at);
        match self.store.rollup(&key).await? {
            Some(row) => Ok(row.value),
            None => Err(EngineError::NotFound {
                series,
                target_id: target_id.to_string(),
                resolution,
                period: key.period,
            }),
        }
    }

    /// Rows with periods in `[from, to)`, oldest first.
    pub async fn aggregate_series(
        &self,
        series: Series,
        target_id: &str,
        resolution: Resolution,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Vec<RollupRow>, EngineError> {
        if !series.supports(resolution) {
            return Err(EngineError::UnsupportedResolution { series, resolution });
        }
        Ok(self
            .store
            .rollups_between(series, target_id, resolution, from, to)
            .await?)
    }
}

/// Number of `meters` holding a pulse at `ts`.
pub(crate) fn count_present<'a, 'm: 'a, I>(
    uow: &'a UnitOfWork<'_>,
    meters: I,
    ts: OffsetDateTime,
) -> futures::future::BoxFuture<'a, Result<u32, EngineError>>
where
    I: IntoIterator<Item = &'m str>,
{
    let meters: Vec<&'m str> = meters.into_iter().collect();
    Box::pin(async move {
        let mut n = 0;
        for id in meters {
            if uow.has_pulse(id, ts).await? {
                n += 1;
            }
        }
        Ok(n)
    })
}
