//! Running means of zone pressure and chlorine level.
//!
//! A sample taken at `ts` describes the quarter-hour ending at `ts`, so it is
//! bucketed by the hour holding `ts - 15m`. The hourly weight is re-derived
//! from the samples already committed for that hour; coarser rows keep their
//! own running weight.

use network_client::{
    db::{Change, RollupOp},
    domain::{Resolution, RollupKey, SensorKind, SensorReading, Series, Target},
};
use time::{Duration, OffsetDateTime};

use super::{normalizer, ticks, unit_of_work::UnitOfWork, Engine, EngineError};

impl Engine {
    /// Store a pressure sample and fold it into every zone the transmitter
    /// contributes to.
    pub async fn record_pressure(
        &self,
        transmitter_id: &str,
        ts: OffsetDateTime,
        raw: &str,
    ) -> Result<SensorReading, EngineError> {
        let transmitter = self
            .network
            .transmitter(transmitter_id)
            .ok_or_else(|| EngineError::UnknownDevice(transmitter_id.to_string()))?;
        let reading = sensor_reading(SensorKind::Pressure, transmitter_id, ts, raw, |v| {
            transmitter.calibration.apply(v)
        })?;

        let links: Vec<_> = transmitter.zones.iter().filter(|l| l.use_for_azp).collect();
        let targets: Vec<Target> = links.iter().map(|l| Target::Zone(l.zone.clone())).collect();

        let _guards = self.locks.lock_all(&targets).await;
        let mut uow = UnitOfWork::new(self.store.as_ref());
        self.stage_reading(&mut uow, &reading).await?;

        for link in links {
            let devices: Vec<String> = self
                .network
                .azp_transmitters(&link.zone)
                .into_iter()
                .map(|(t, _)| t.id.clone())
                .collect();
            fold_sample(
                &mut uow,
                Series::ZonePressure,
                &link.zone,
                SensorKind::Pressure,
                &devices,
                reading.ts,
                reading.calibrated * link.azp_factor,
            )
            .await?;
        }

        self.store.commit(uow.finish()).await?;
        metrics::counter!("reconcile_pressure_readings_total").increment(1);
        Ok(reading)
    }

    pub async fn record_chlorine(
        &self,
        sensor_id: &str,
        ts: OffsetDateTime,
        raw: &str,
    ) -> Result<SensorReading, EngineError> {
        let sensor = self
            .network
            .chlorine_sensor(sensor_id)
            .ok_or_else(|| EngineError::UnknownDevice(sensor_id.to_string()))?;
        let reading = sensor_reading(SensorKind::Chlorine, sensor_id, ts, raw, |v| {
            sensor.calibration.apply(v)
        })?;

        let _guards = self
            .locks
            .lock_all(&[Target::Sensor(sensor_id.to_string())])
            .await;
        let mut uow = UnitOfWork::new(self.store.as_ref());
        self.stage_reading(&mut uow, &reading).await?;
        fold_sample(
            &mut uow,
            Series::ChlorineLevel,
            sensor_id,
            SensorKind::Chlorine,
            &[sensor_id.to_string()],
            reading.ts,
            reading.calibrated,
        )
        .await?;

        self.store.commit(uow.finish()).await?;
        metrics::counter!("reconcile_chlorine_readings_total").increment(1);
        Ok(reading)
    }

    async fn stage_reading(&self, uow: &mut UnitOfWork<'_>, reading: &SensorReading) -> Result<(), EngineError> {
        if let Some(existing) = uow
            .store()
            .reading(reading.kind, &reading.device_id, reading.ts)
            .await?
        {
            if existing.raw == reading.raw {
                return Err(EngineError::DuplicateReading {
                    kind: reading.kind,
                    device_id: reading.device_id.clone(),
                    ts: reading.ts,
                });
            }
            return Err(EngineError::InvalidReading(format!(
                "{} reading {}@{} conflicts with the recorded one",
                reading.kind, reading.device_id, reading.ts
            )));
        }
        uow.stage(Change::InsertReading(reading.clone()));
        Ok(())
    }
}

fn sensor_reading(
    kind: SensorKind,
    device_id: &str,
    ts: OffsetDateTime,
    raw: &str,
    calibrate: impl Fn(f64) -> f64,
) -> Result<SensorReading, EngineError> {
    let value = normalizer::parse_raw(raw)?;
    Ok(SensorReading {
        kind,
        device_id: device_id.to_string(),
        ts: ticks::truncate_to_minute(ts),
        raw: raw.trim().to_string(),
        calibrated: calibrate(value),
    })
}

/// Hour bucket a sample at `ts` belongs to.
pub fn sample_hour(ts: OffsetDateTime) -> OffsetDateTime {
    ticks::hour_start(ticks::offset_time(ts))
}

fn fold_sample<'a>(
    uow: &'a mut UnitOfWork<'_>,
    series: Series,
    target_id: &'a str,
    kind: SensorKind,
    devices: &'a [String],
    ts: OffsetDateTime,
    value: f64,
) -> futures::future::BoxFuture<'a, Result<(), EngineError>> {
    Box::pin(async move {
    let hour = sample_hour(ts);
    let seen = uow
        .store()
        .count_readings(kind, devices, hour + ticks::RIE, hour + Duration::hours(1))
        .await?;

    uow.rollup(
        RollupKey::new(series, target_id, Resolution::Hour, hour),
        RollupOp::Average {
            value,
            seed: Some(seen),
        },
    );
    for res in [Resolution::Day, Resolution::Month, Resolution::Year] {
        uow.rollup(
            RollupKey::containing(series, target_id, res, hour),
            RollupOp::Average { value, seed: None },
        );
    }
    Ok(())
    })
}
