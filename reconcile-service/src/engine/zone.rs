//! Zone consumption: inputs minus outputs over every quarter-hour.

use network_client::domain::{PendingKey, PendingKind, PendingRecord, Pulse, Series, Target};
use time::{Duration, OffsetDateTime};

use super::{
    barrier, count_present, normalizer, rollup, ticks, unit_of_work::UnitOfWork, Engine,
    EngineError, NightlyDue, Outcome,
};

/// Tick of the last complete pulse group before a gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Base {
    /// Some meter has never reported before the gap.
    Missing,
    /// Every meter reported at this tick.
    Found(OffsetDateTime),
    /// No complete group inside the reset horizon.
    TooOld,
}

impl Engine {
    pub(crate) async fn reconcile_zone(
        &self,
        uow: &mut UnitOfWork<'_>,
        zone_id: &str,
        pulse: &Pulse,
        out: &mut Outcome,
    ) -> Result<(), EngineError> {
        let target = Target::Zone(zone_id.to_string());
        let meters: Vec<&str> = self
            .network
            .zone_meters(zone_id)
            .into_iter()
            .map(|m| m.id.as_str())
            .collect();

        let mut records = uow.pending_for(&target).await?;
        let mut has_own = false;

        for rec in records.iter_mut() {
            if rec.key.kind != PendingKind::ZoneConsumption {
                return Err(EngineError::InconsistentMatch(format!(
                    "{:?} record pending on {target}",
                    rec.key.kind
                )));
            }
            if rec.key.tick == pulse.ts {
                has_own = true;
            }
            let Some(slot) = barrier::zone_slot(rec, pulse.ts) else {
                continue;
            };
            barrier::ensure_member(&self.network, rec, &pulse.meter_id)?;
            barrier::register(rec, slot, &pulse.meter_id)?;
            tracing::trace!(zone = %zone_id, tick = %rec.key.tick, %slot, missing = rec.missing(), "pulse matched");
            uow.put_pending(rec.clone());
        }

        if !has_own {
            let key = PendingKey {
                target: target.clone(),
                tick: pulse.ts,
                kind: PendingKind::ZoneConsumption,
            };
            let current = count_present(uow, meters.iter().copied(), pulse.ts).await?;
            let past = count_present(uow, meters.iter().copied(), ticks::offset_time(pulse.ts)).await?;
            let rec = PendingRecord::new(key, meters.len() as u32, current, past);
            uow.put_pending(rec.clone());
            records.push(rec);
        }

        let watermark = records.iter().map(|r| r.key.tick).fold(pulse.ts, OffsetDateTime::max);
        records.sort_by_key(|r| r.key.tick);

        let mut waiting = Vec::new();
        for rec in records {
            if rec.is_complete() {
                self.settle_zone_window(uow, zone_id, rec.key.tick, out).await?;
                uow.delete_pending(&rec.key);
            } else {
                waiting.push(rec);
            }
        }

        for rec in waiting {
            if rec.key.tick + self.settings.late_tolerance > watermark {
                break;
            }
            self.expire_zone_record(uow, zone_id, rec, out).await?;
        }

        Ok(())
    }

    async fn settle_zone_window(
        &self,
        uow: &mut UnitOfWork<'_>,
        zone_id: &str,
        tick: OffsetDateTime,
        out: &mut Outcome,
    ) -> Result<(), EngineError> {
        let start = ticks::offset_time(tick);
        let value = self.zone_delta(uow, zone_id, start, tick).await?;
        let w = rollup::accumulate_window(uow, Series::ZoneConsumption, zone_id, start, tick, Some(value))
            .await?;
        self.close_zone_tick(zone_id, tick, w, out);
        Ok(())
    }

    fn close_zone_tick(
        &self,
        zone_id: &str,
        tick: OffsetDateTime,
        w: Option<rollup::ReconciledWindow>,
        out: &mut Outcome,
    ) {
        if w.is_some() && ticks::is_midnight(tick) {
            out.nightly_due.push(NightlyDue {
                zone_id: zone_id.to_string(),
                night: (tick - Duration::days(1)).date(),
            });
        }
        out.window(w);
    }

    /// Sum of input deltas minus output deltas between two ticks.
    pub(crate) async fn zone_delta(
        &self,
        uow: &UnitOfWork<'_>,
        zone_id: &str,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<f64, EngineError> {
        let mut total = 0.0;
        let sides = [
            (self.network.zone_inputs(zone_id), 1.0),
            (self.network.zone_outputs(zone_id), -1.0),
        ];
        for (ids, sign) in sides {
            for id in ids {
                let meter = self
                    .network
                    .meter(id)
                    .ok_or_else(|| EngineError::UnknownDevice(id.clone()))?;
                let cur = uow
                    .pulse(id, to)
                    .await?
                    .ok_or_else(|| EngineError::MissingBaseline {
                        meter_id: id.clone(),
                        ts: to,
                    })?;
                let prev = uow.pulse(id, from).await?;
                total += sign * normalizer::consumption_between(prev.as_ref(), &cur, &meter.calibration)?;
            }
        }
        Ok(total)
    }

    /// The zone has moved past `rec` by the late tolerance, so whatever it
    /// still lacks is lost.
    ///
    /// A record without its own current group is dropped: its window falls
    /// inside the gap closed by the next complete group. A record with a
    /// complete current group closes that gap, filled from the last complete
    /// pulse group before it.
    async fn expire_zone_record(
        &self,
        uow: &mut UnitOfWork<'_>,
        zone_id: &str,
        rec: PendingRecord,
        out: &mut Outcome,
    ) -> Result<(), EngineError> {
        uow.delete_pending(&rec.key);
        let tick = rec.key.tick;
        if !rec.current_complete() {
            tracing::debug!(zone = %zone_id, %tick, missing = rec.missing(), "pulse group lost");
            metrics::counter!("reconcile_pending_expired_total").increment(1);
            return Ok(());
        }
        metrics::counter!("reconcile_gaps_resolved_total").increment(1);

        match self.find_base(uow, zone_id, tick).await? {
            Base::Missing => {
                tracing::warn!(zone = %zone_id, %tick, "no baseline before gap, recording null window");
                let w = rollup::accumulate_window(
                    uow,
                    Series::ZoneConsumption,
                    zone_id,
                    ticks::offset_time(tick),
                    tick,
                    None,
                )
                .await?;
                self.close_zone_tick(zone_id, tick, w, out);
            }
            Base::TooOld => {
                tracing::warn!(
                    zone = %zone_id,
                    %tick,
                    reset_after = %self.settings.gap_reset_after,
                    "gap exceeds reset horizon, recording zero"
                );
                metrics::counter!("reconcile_gap_resets_total").increment(1);
                let w = rollup::accumulate_window(
                    uow,
                    Series::ZoneConsumption,
                    zone_id,
                    ticks::offset_time(tick),
                    tick,
                    Some(0.0),
                )
                .await?;
                self.close_zone_tick(zone_id, tick, w, out);
            }
            Base::Found(base) => {
                let total = self.zone_delta(uow, zone_id, base, tick).await?;
                let parts = rollup::split_evenly(base, tick, total);
                tracing::info!(
                    zone = %zone_id,
                    %base,
                    %tick,
                    ticks = parts.len(),
                    total,
                    "distributing consumption over gap"
                );
                for (t, share) in parts {
                    let w = rollup::accumulate_window(
                        uow,
                        Series::ZoneConsumption,
                        zone_id,
                        ticks::offset_time(t),
                        t,
                        Some(share),
                    )
                    .await?;
                    self.close_zone_tick(zone_id, t, w, out);
                }
            }
        }
        Ok(())
    }

    /// Walk back from `tick` to the latest instant at which every meter of the
    /// zone has a pulse.
    async fn find_base(
        &self,
        uow: &UnitOfWork<'_>,
        zone_id: &str,
        tick: OffsetDateTime,
    ) -> Result<Base, EngineError> {
        let meters = self.network.zone_meters(zone_id);
        if meters.is_empty() {
            return Ok(Base::Missing);
        }
        let floor = tick - self.settings.gap_reset_after;
        let mut bound = tick;

        loop {
            let mut candidate: Option<OffsetDateTime> = None;
            for m in &meters {
                match uow.latest_pulse_before(&m.id, bound).await? {
                    Some(p) => candidate = Some(candidate.map_or(p.ts, |c| c.min(p.ts))),
                    None => return Ok(Base::Missing),
                }
            }
            let Some(c) = candidate else {
                return Ok(Base::Missing);
            };
            if c < floor {
                return Ok(Base::TooOld);
            }
            let present = count_present(uow, meters.iter().map(|m| m.id.as_str()), c).await?;
            if present as usize == meters.len() {
                return Ok(Base::Found(c));
            }
            bound = c;
        }
    }
}
