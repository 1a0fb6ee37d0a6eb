//! Transmission lines: quarter-hour inflow at the output end and the daily
//! loss between both ends.

use network_client::domain::{PendingKey, PendingKind, PendingRecord, Pulse, Series, Target};
use time::{Date, Duration, OffsetDateTime};

use super::{
    barrier::{self, Slot},
    count_present, normalizer, rollup, ticks,
    unit_of_work::UnitOfWork,
    Engine, EngineError, Outcome,
};

/// Loss beyond what the line's own volume accounts for.
pub fn excess_loss(loss: f64, volume: f64) -> f64 {
    if loss <= volume {
        0.0
    } else {
        loss - volume
    }
}

/// Latest instant a line record waits on.
fn last_awaited(rec: &PendingRecord) -> OffsetDateTime {
    match rec.key.kind {
        PendingKind::LineLoss => ticks::closure(rec.key.tick.date()),
        _ => rec.key.tick,
    }
}

impl Engine {
    pub(crate) async fn reconcile_line(
        &self,
        uow: &mut UnitOfWork<'_>,
        line_id: &str,
        pulse: &Pulse,
        out: &mut Outcome,
    ) -> Result<(), EngineError> {
        let target = Target::Line(line_id.to_string());
        let ends = self
            .network
            .line_ends(line_id)
            .ok_or_else(|| EngineError::UnknownDevice(line_id.to_string()))?;
        let from_output = ends.output == pulse.meter_id;

        let mut records = uow.pending_for(&target).await?;
        let mut closed_loss = false;
        let mut completed = Vec::new();

        for rec in records.iter_mut() {
            let slot = match rec.key.kind {
                PendingKind::LineInflow => barrier::inflow_slot(rec, pulse.ts, from_output),
                PendingKind::LineLoss => barrier::loss_slot(rec, pulse.ts),
                PendingKind::ZoneConsumption => {
                    return Err(EngineError::InconsistentMatch(format!(
                        "zone record pending on {target}"
                    )))
                }
            };
            let Some(slot) = slot else {
                continue;
            };
            barrier::ensure_member(&self.network, rec, &pulse.meter_id)?;
            barrier::register(rec, slot, &pulse.meter_id)?;
            if rec.key.kind == PendingKind::LineLoss && slot == Slot::Current {
                closed_loss = true;
            }
            uow.put_pending(rec.clone());
            if rec.is_complete() {
                completed.push(rec.clone());
            }
        }

        let meters = [ends.input.as_str(), ends.output.as_str()];

        // The midnight pulse closes yesterday's loss window.
        if ticks::is_midnight(pulse.ts) && !closed_loss {
            let day = (pulse.ts - Duration::days(1)).date();
            let key = PendingKey {
                target: target.clone(),
                tick: ticks::day_start(day),
                kind: PendingKind::LineLoss,
            };
            if !records.iter().any(|r| r.key == key) {
                let current = count_present(uow, meters, ticks::closure(day)).await?;
                let past = count_present(uow, meters, ticks::kickoff(day)).await?;
                let rec = PendingRecord::new(key, 2, current, past);
                uow.put_pending(rec.clone());
                if rec.is_complete() {
                    completed.push(rec);
                }
            }
        }

        if from_output {
            let key = PendingKey {
                target: target.clone(),
                tick: pulse.ts,
                kind: PendingKind::LineInflow,
            };
            if !records.iter().any(|r| r.key == key) {
                let past = u32::from(uow.has_pulse(&ends.output, ticks::offset_time(pulse.ts)).await?);
                let rec = PendingRecord::new(key, 1, 1, past);
                uow.put_pending(rec.clone());
                if rec.is_complete() {
                    completed.push(rec);
                }
            }
        }

        completed.sort_by_key(|r| r.key.tick);
        for rec in completed {
            match rec.key.kind {
                PendingKind::LineInflow => self.settle_inflow(uow, line_id, rec.key.tick, out).await?,
                PendingKind::LineLoss => {
                    self.settle_loss(uow, line_id, rec.key.tick.date(), out).await?
                }
                PendingKind::ZoneConsumption => {}
            }
            uow.delete_pending(&rec.key);
        }

        let watermark = records.iter().map(last_awaited).fold(pulse.ts, OffsetDateTime::max);
        for rec in records.iter().filter(|r| !r.is_complete()) {
            if last_awaited(rec) + self.settings.late_tolerance <= watermark {
                tracing::debug!(
                    line = %line_id,
                    tick = %rec.key.tick,
                    kind = rec.key.kind.as_str(),
                    missing = rec.missing(),
                    "pulse lost, dropping record"
                );
                metrics::counter!("reconcile_pending_expired_total").increment(1);
                uow.delete_pending(&rec.key);
            }
        }

        Ok(())
    }

    async fn settle_inflow(
        &self,
        uow: &mut UnitOfWork<'_>,
        line_id: &str,
        tick: OffsetDateTime,
        out: &mut Outcome,
    ) -> Result<(), EngineError> {
        let ends = self
            .network
            .line_ends(line_id)
            .ok_or_else(|| EngineError::UnknownDevice(line_id.to_string()))?;
        let start = ticks::offset_time(tick);
        let value = self.meter_delta(uow, &ends.output, start, tick).await?;
        let w = rollup::accumulate_window(uow, Series::LineInflow, line_id, start, tick, Some(value)).await?;
        out.window(w);
        Ok(())
    }

    async fn settle_loss(
        &self,
        uow: &mut UnitOfWork<'_>,
        line_id: &str,
        day: Date,
        out: &mut Outcome,
    ) -> Result<(), EngineError> {
        let line = self
            .network
            .line(line_id)
            .ok_or_else(|| EngineError::UnknownDevice(line_id.to_string()))?;
        let ends = self
            .network
            .line_ends(line_id)
            .ok_or_else(|| EngineError::UnknownDevice(line_id.to_string()))?;

        let (from, to) = (ticks::kickoff(day), ticks::closure(day));
        let inflow = self.meter_delta(uow, &ends.input, from, to).await?;
        let outflow = self.meter_delta(uow, &ends.output, from, to).await?;
        let loss = excess_loss(inflow - outflow, line.volume);

        tracing::debug!(line = %line_id, %day, inflow, outflow, loss, "line loss settled");
        rollup::accumulate_daily(uow, Series::LineLoss, line_id, day, loss);
        out.windows.push(rollup::ReconciledWindow {
            series: Series::LineLoss,
            target_id: line_id.to_string(),
            start: from,
            end: to,
            value: Some(loss),
        });
        Ok(())
    }

    async fn meter_delta(
        &self,
        uow: &UnitOfWork<'_>,
        meter_id: &str,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<f64, EngineError> {
        let meter = self
            .network
            .meter(meter_id)
            .ok_or_else(|| EngineError::UnknownDevice(meter_id.to_string()))?;
        let cur = uow
            .pulse(meter_id, to)
            .await?
            .ok_or_else(|| EngineError::MissingBaseline {
                meter_id: meter_id.to_string(),
                ts: to,
            })?;
        let prev = uow.pulse(meter_id, from).await?;
        normalizer::consumption_between(prev.as_ref(), &cur, &meter.calibration)
    }
}
