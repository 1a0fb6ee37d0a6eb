//! Minimum night flow leak estimation.
//!
//! The average inflow of a zone during the night window, less its legitimate
//! night use, is the leak rate at minimum pressure. The night-day factor
//! `FND = Σ (P_i / P_mnf)^N1` over the hourly pressures of the day scales it
//! to a daily leak.

use network_client::{
    db::Change,
    domain::{Alert, AlertKind, LossRecord, Resolution, Series, Target, Zone},
};
use serde::Serialize;
use time::{Date, Duration, OffsetDateTime};

use super::{keys, rollup, ticks, unit_of_work::UnitOfWork, Engine, EngineError};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NightlyLeak {
    pub loss_record: LossRecord,
    pub alert: Option<Alert>,
    /// Leak rate during the night window, per hour.
    pub mnf_leak: f64,
    pub night_day_factor: f64,
}

/// `Σ (p / p_mnf)^n1`.
pub fn night_day_factor(pressures: &[f64], p_mnf: f64, n1: f64) -> f64 {
    pressures.iter().map(|p| (p / p_mnf).powf(n1)).sum()
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

impl Engine {
    pub async fn run_nightly_leak_estimate(
        &self,
        zone_id: &str,
        night: Date,
    ) -> Result<NightlyLeak, EngineError> {
        let zone = self
            .network
            .zone(zone_id)
            .ok_or_else(|| EngineError::UnknownDevice(zone_id.to_string()))?;
        let indeterminate = |reason: String| EngineError::IndeterminateLeakEstimate {
            zone_id: zone_id.to_string(),
            night,
            reason,
        };

        let guards = self.locks.lock_all(&[Target::Zone(zone_id.to_string())]).await;
        if self.store.loss_record(zone_id, night).await?.is_some() {
            return Err(EngineError::AlreadyEstimated {
                zone_id: zone_id.to_string(),
                night,
            });
        }

        let day = ticks::day_start(night);
        let start = day + (self.settings.mnf_start - time::Time::MIDNIGHT);
        let end = day + (self.settings.mnf_end - time::Time::MIDNIGHT);
        // The first reading of the window covers the quarter-hour before it.
        let first = ticks::offset_time(start);

        let mut uow = UnitOfWork::new(self.store.as_ref());
        let consumption = match self.zone_delta(&uow, zone_id, first, end).await {
            Ok(v) => v,
            Err(EngineError::MissingBaseline { meter_id, ts }) => {
                return Err(indeterminate(format!("no pulse from meter '{meter_id}' around {ts}")))
            }
            Err(e) => return Err(e),
        };
        let hours = (end - first).as_seconds_f64() / 3600.0;
        let mnf_leak = consumption / hours - zone.legitimate_night_use;

        let p_mnf = mean(&self.hourly_pressures(zone_id, start, end).await?)
            .ok_or_else(|| indeterminate("no hourly pressure inside the night window".to_string()))?;
        if p_mnf == 0.0 {
            return Err(indeterminate("night pressure is zero".to_string()));
        }

        let day_pressures = self.hourly_pressures(zone_id, day, day + Duration::days(1)).await?;
        let fnd = night_day_factor(&day_pressures, p_mnf, zone.n1);
        let daily_leak = mnf_leak * fnd;

        let loss_record = LossRecord {
            zone_id: zone_id.to_string(),
            night,
            amount: daily_leak,
        };
        uow.stage(Change::InsertLossRecord(loss_record.clone()));
        rollup::accumulate_daily(&mut uow, Series::ZoneLoss, zone_id, night, daily_leak);

        let alert = if daily_leak > zone.burst_threshold {
            let alert = self.leak_alert(zone, night, daily_leak).await?;
            uow.stage(Change::InsertAlert(alert.clone()));
            Some(alert)
        } else {
            None
        };

        self.store.commit(uow.finish()).await?;
        drop(guards);

        metrics::counter!("reconcile_leak_estimates_total").increment(1);
        tracing::info!(
            zone = %zone_id,
            %night,
            consumption,
            mnf_leak,
            fnd,
            daily_leak,
            alert = alert.as_ref().map(|a| a.key.as_str()),
            "nightly leak estimated"
        );

        if let Some(alert) = &alert {
            metrics::counter!("reconcile_leak_alerts_total").increment(1);
            for subscriber in self.network.subscribers() {
                if let Err(e) = self.hooks.notifications.notify(subscriber, alert).await {
                    tracing::warn!(subscriber = %subscriber, alert = %alert.key, error = %e, "alert notification failed");
                }
            }
        }

        Ok(NightlyLeak {
            loss_record,
            alert,
            mnf_leak,
            night_day_factor: fnd,
        })
    }

    async fn hourly_pressures(
        &self,
        zone_id: &str,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Vec<f64>, EngineError> {
        Ok(self
            .store
            .rollups_between(Series::ZonePressure, zone_id, Resolution::Hour, from, to)
            .await?
            .into_iter()
            .filter_map(|r| r.value)
            .collect())
    }

    async fn leak_alert(&self, zone: &Zone, night: Date, daily_leak: f64) -> Result<Alert, EngineError> {
        let serial = self.store.next_serial(&keys::alert_scope(night)).await?;
        Ok(Alert {
            key: keys::alert_key(night, serial),
            zone_id: zone.id.clone(),
            night,
            kind: AlertKind::Leak,
            loss_amount: daily_leak - zone.burst_threshold,
            raised_at: OffsetDateTime::now_utc(),
        })
    }
}
