use std::collections::{BTreeMap, HashMap, HashSet};

use time::{Date, OffsetDateTime};
use tokio::sync::RwLock;

use super::{Change, Changeset, EntityStore, RollupOp, StoreError};
use crate::domain::{
    Alert, LossRecord, PendingKey, PendingRecord, Pulse, Resolution, RollupKey, RollupRow,
    SensorKind, SensorReading, Series, Target,
};

type PulseIdx = (String, OffsetDateTime);
type ReadingIdx = (SensorKind, String, OffsetDateTime);

#[derive(Default)]
struct State {
    pulses: BTreeMap<PulseIdx, Pulse>,
    readings: BTreeMap<ReadingIdx, SensorReading>,
    pending: BTreeMap<PendingKey, PendingRecord>,
    rollups: BTreeMap<RollupKey, RollupRow>,
    losses: BTreeMap<(String, Date), LossRecord>,
    alerts: Vec<Alert>,
    serials: HashMap<String, i64>,
}

/// In-process store used by tests and single-node deployments.
///
/// A commit takes the write lock, validates the whole changeset and only then
/// applies it, so readers never observe half of a unit of work.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

pub(crate) fn fold_average(row: Option<&RollupRow>, value: f64, seed: Option<i64>) -> (f64, i64) {
    match row.and_then(|r| r.value.map(|v| (v, r.weight))) {
        None => (value, 1),
        Some((avg, weight)) => {
            let w = seed.unwrap_or(weight);
            ((avg * w as f64 + value) / (w + 1) as f64, w + 1)
        }
    }
}

fn validate(state: &State, changes: &[Change]) -> Result<(), StoreError> {
    let mut pulses: HashSet<PulseIdx> = HashSet::new();
    let mut readings: HashSet<ReadingIdx> = HashSet::new();
    let mut quarter_hours: HashSet<&RollupKey> = HashSet::new();
    let mut losses: HashSet<(&str, Date)> = HashSet::new();
    let mut alerts: HashSet<&str> = HashSet::new();

    for change in changes {
        match change {
            Change::InsertPulse(p) => {
                let idx = (p.meter_id.clone(), p.ts);
                if state.pulses.contains_key(&idx) || !pulses.insert(idx) {
                    return Err(StoreError::Duplicate(format!("pulse {}", p.key())));
                }
            }
            Change::InsertReading(r) => {
                let idx = (r.kind, r.device_id.clone(), r.ts);
                if state.readings.contains_key(&idx) || !readings.insert(idx) {
                    return Err(StoreError::Duplicate(format!(
                        "{} reading {}@{}",
                        r.kind.as_str(),
                        r.device_id,
                        r.ts
                    )));
                }
            }
            Change::Rollup {
                key,
                op: RollupOp::Set(_),
            } => {
                if state.rollups.contains_key(key) || !quarter_hours.insert(key) {
                    return Err(StoreError::Conflict(format!(
                        "{} row for {} at {} already written",
                        key.series, key.target_id, key.period
                    )));
                }
            }
            Change::DeletePending(key) => {
                if !state.pending.contains_key(key) {
                    return Err(StoreError::Contention(format!(
                        "pending {} at {} vanished",
                        key.target, key.tick
                    )));
                }
            }
            Change::InsertLossRecord(l) => {
                if state.losses.contains_key(&(l.zone_id.clone(), l.night))
                    || !losses.insert((l.zone_id.as_str(), l.night))
                {
                    return Err(StoreError::Duplicate(format!(
                        "loss record {} {}",
                        l.zone_id, l.night
                    )));
                }
            }
            Change::InsertAlert(a) => {
                if state.alerts.iter().any(|x| x.key == a.key) || !alerts.insert(a.key.as_str()) {
                    return Err(StoreError::Duplicate(format!("alert {}", a.key)));
                }
            }
            Change::SetAnomaly { key, .. } => {
                let idx = (key.meter_id.clone(), key.ts);
                if !state.pulses.contains_key(&idx) && !pulses.contains(&idx) {
                    return Err(StoreError::Conflict(format!("unknown pulse {key}")));
                }
            }
            Change::PutPending(_) | Change::Rollup { .. } => {}
        }
    }

    Ok(())
}

fn apply(state: &mut State, change: Change) {
    match change {
        Change::InsertPulse(p) => {
            state.pulses.insert((p.meter_id.clone(), p.ts), p);
        }
        Change::InsertReading(r) => {
            state.readings.insert((r.kind, r.device_id.clone(), r.ts), r);
        }
        Change::PutPending(rec) => {
            state.pending.insert(rec.key.clone(), rec);
        }
        Change::DeletePending(key) => {
            state.pending.remove(&key);
        }
        Change::Rollup { key, op } => {
            let existing = state.rollups.get(&key);
            let (value, weight) = match op {
                RollupOp::Set(v) => (v, 1),
                RollupOp::Add(x) => match existing {
                    Some(row) => (Some(row.value.unwrap_or(0.0) + x), row.weight + 1),
                    None => (Some(x), 1),
                },
                RollupOp::Average { value, seed } => {
                    let (v, w) = fold_average(existing, value, seed);
                    (Some(v), w)
                }
            };
            state.rollups.insert(key.clone(), RollupRow { key, value, weight });
        }
        Change::InsertLossRecord(l) => {
            state.losses.insert((l.zone_id.clone(), l.night), l);
        }
        Change::InsertAlert(a) => state.alerts.push(a),
        Change::SetAnomaly { key, anomaly } => {
            if let Some(p) = state.pulses.get_mut(&(key.meter_id, key.ts)) {
                p.anomaly = Some(anomaly);
            }
        }
    }
}

#[async_trait::async_trait]
impl EntityStore for MemoryStore {
    async fn pulse(&self, meter_id: &str, ts: OffsetDateTime) -> Result<Option<Pulse>, StoreError> {
        let state = self.state.read().await;
        Ok(state.pulses.get(&(meter_id.to_string(), ts)).cloned())
    }

    async fn latest_pulse_before(
        &self,
        meter_id: &str,
        before: OffsetDateTime,
    ) -> Result<Option<Pulse>, StoreError> {
        let state = self.state.read().await;
        let hi = (meter_id.to_string(), before);
        Ok(state
            .pulses
            .range(..hi)
            .next_back()
            .filter(|((m, _), _)| m == meter_id)
            .map(|(_, p)| p.clone()))
    }

    async fn pulses_between(
        &self,
        meter_id: &str,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Vec<Pulse>, StoreError> {
        if from >= to {
            return Ok(Vec::new());
        }
        let state = self.state.read().await;
        Ok(state
            .pulses
            .range((meter_id.to_string(), from)..(meter_id.to_string(), to))
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn reading(
        &self,
        kind: SensorKind,
        device_id: &str,
        ts: OffsetDateTime,
    ) -> Result<Option<SensorReading>, StoreError> {
        let state = self.state.read().await;
        Ok(state.readings.get(&(kind, device_id.to_string(), ts)).cloned())
    }

    async fn count_readings(
        &self,
        kind: SensorKind,
        device_ids: &[String],
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<i64, StoreError> {
        if from > to {
            return Ok(0);
        }
        let state = self.state.read().await;
        let n = device_ids
            .iter()
            .map(|d| {
                state
                    .readings
                    .range((kind, d.clone(), from)..=(kind, d.clone(), to))
                    .count()
            })
            .sum::<usize>();
        Ok(n as i64)
    }

    async fn pending_for(&self, target: &Target) -> Result<Vec<PendingRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .pending
            .values()
            .filter(|r| &r.key.target == target)
            .cloned()
            .collect())
    }

    async fn rollup(&self, key: &RollupKey) -> Result<Option<RollupRow>, StoreError> {
        let state = self.state.read().await;
        Ok(state.rollups.get(key).cloned())
    }

    async fn rollups_between(
        &self,
        series: Series,
        target_id: &str,
        resolution: Resolution,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Vec<RollupRow>, StoreError> {
        if from >= to {
            return Ok(Vec::new());
        }
        let lo = RollupKey::new(series, target_id, resolution, from);
        let hi = RollupKey::new(series, target_id, resolution, to);
        let state = self.state.read().await;
        Ok(state.rollups.range(lo..hi).map(|(_, r)| r.clone()).collect())
    }

    async fn loss_record(&self, zone_id: &str, night: Date) -> Result<Option<LossRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state.losses.get(&(zone_id.to_string(), night)).cloned())
    }

    async fn alerts_for(&self, zone_id: &str) -> Result<Vec<Alert>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .alerts
            .iter()
            .filter(|a| a.zone_id == zone_id)
            .cloned()
            .collect())
    }

    async fn next_serial(&self, scope: &str) -> Result<i64, StoreError> {
        let mut state = self.state.write().await;
        let counter = state.serials.entry(scope.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn commit(&self, changes: Changeset) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let changes = changes.into_changes();
        validate(&state, &changes)?;
        for change in changes {
            apply(&mut state, change);
        }
        Ok(())
    }
}
