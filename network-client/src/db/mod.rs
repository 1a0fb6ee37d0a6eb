pub mod memory;
pub mod postgres;
pub mod rollup_queries;

use time::{Date, OffsetDateTime};

use crate::domain::{
    Alert, LossRecord, PendingKey, PendingRecord, Pulse, PulseKey, Resolution, RollupKey,
    RollupRow, SensorKind, SensorReading, Series, Target,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// A unique row (pulse, reading, loss record) already exists.
    #[error("duplicate: {0}")]
    Duplicate(String),
    /// The changeset contradicts committed state.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Lost a race with a concurrent unit of work; safe to re-run.
    #[error("contention: {0}")]
    Contention(String),
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Contention(_))
    }
}

/// How a staged change updates a rollup row.
#[derive(Debug, Clone, PartialEq)]
pub enum RollupOp {
    /// Write a quarter-hour row; fails if the row exists.
    Set(Option<f64>),
    /// Create with `value` or add it to the running sum.
    Add(f64),
    /// Fold `value` into a running mean. `seed` overrides the stored weight
    /// of an existing row.
    Average { value: f64, seed: Option<i64> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    InsertPulse(Pulse),
    InsertReading(SensorReading),
    PutPending(PendingRecord),
    DeletePending(PendingKey),
    Rollup { key: RollupKey, op: RollupOp },
    InsertLossRecord(LossRecord),
    InsertAlert(Alert),
    SetAnomaly { key: PulseKey, anomaly: bool },
}

/// Every mutation of one unit of work, applied atomically by [`EntityStore::commit`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Changeset {
    changes: Vec<Change>,
}

impl Changeset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, change: Change) {
        self.changes.push(change);
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.changes.iter()
    }

    pub fn into_changes(self) -> Vec<Change> {
        self.changes
    }
}

impl Extend<Change> for Changeset {
    fn extend<I: IntoIterator<Item = Change>>(&mut self, iter: I) {
        self.changes.extend(iter);
    }
}

/// Durable keyed storage behind the reconciliation engine.
///
/// Reads see committed state only. Writes are staged in a [`Changeset`] and
/// become visible together on `commit`, or not at all.
#[async_trait::async_trait]
pub trait EntityStore: Send + Sync {
    async fn pulse(&self, meter_id: &str, ts: OffsetDateTime) -> Result<Option<Pulse>, StoreError>;

    /// Latest pulse of the meter strictly before `before`.
    async fn latest_pulse_before(
        &self,
        meter_id: &str,
        before: OffsetDateTime,
    ) -> Result<Option<Pulse>, StoreError>;

    /// Pulses of the meter with `from <= ts < to`, ordered by time.
    async fn pulses_between(
        &self,
        meter_id: &str,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Vec<Pulse>, StoreError>;

    async fn reading(
        &self,
        kind: SensorKind,
        device_id: &str,
        ts: OffsetDateTime,
    ) -> Result<Option<SensorReading>, StoreError>;

    /// Readings of the given devices with `from <= ts <= to`.
    async fn count_readings(
        &self,
        kind: SensorKind,
        device_ids: &[String],
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<i64, StoreError>;

    async fn pending_for(&self, target: &Target) -> Result<Vec<PendingRecord>, StoreError>;

    async fn rollup(&self, key: &RollupKey) -> Result<Option<RollupRow>, StoreError>;

    /// Rows of one series and resolution with `from <= period < to`, ordered by period.
    async fn rollups_between(
        &self,
        series: Series,
        target_id: &str,
        resolution: Resolution,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Vec<RollupRow>, StoreError>;

    async fn loss_record(&self, zone_id: &str, night: Date) -> Result<Option<LossRecord>, StoreError>;

    async fn alerts_for(&self, zone_id: &str) -> Result<Vec<Alert>, StoreError>;

    /// Next value of a named counter, starting at 1.
    async fn next_serial(&self, scope: &str) -> Result<i64, StoreError>;

    async fn commit(&self, changes: Changeset) -> Result<(), StoreError>;
}
