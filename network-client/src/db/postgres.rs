use sqlx::{PgPool, Postgres, Transaction};
use time::{Date, OffsetDateTime};

use super::{rollup_queries, Change, Changeset, EntityStore, RollupOp, StoreError};
use crate::domain::{
    Alert, AlertKind, LossRecord, PendingKey, PendingKind, PendingRecord, Pulse, Resolution,
    RollupKey, RollupRow, SensorKind, SensorReading, Series, Target,
};

const SCHEMA: &str = include_str!("../../../sql/schema/01_reconciliation.sql");

/// Postgres-backed store; every commit runs in one transaction.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

#[derive(Debug, sqlx::FromRow)]
struct ReadingRow {
    kind: String,
    device_id: String,
    ts: OffsetDateTime,
    raw: String,
    calibrated: f64,
}

#[derive(Debug, sqlx::FromRow)]
struct PendingRow {
    target_kind: String,
    target_id: String,
    tick: OffsetDateTime,
    kind: String,
    expected: i32,
    current_arrived: i32,
    past_arrived: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct AlertRow {
    key: String,
    zone_id: String,
    night: Date,
    kind: String,
    loss_amount: f64,
    raised_at: OffsetDateTime,
}

impl TryFrom<ReadingRow> for SensorReading {
    type Error = StoreError;

    fn try_from(r: ReadingRow) -> Result<Self, Self::Error> {
        let kind = SensorKind::parse(&r.kind)
            .ok_or_else(|| StoreError::Backend(format!("unknown sensor kind '{}'", r.kind)))?;
        Ok(SensorReading {
            kind,
            device_id: r.device_id,
            ts: r.ts,
            raw: r.raw,
            calibrated: r.calibrated,
        })
    }
}

impl TryFrom<PendingRow> for PendingRecord {
    type Error = StoreError;

    fn try_from(r: PendingRow) -> Result<Self, Self::Error> {
        let target = Target::from_parts(&r.target_kind, r.target_id)
            .ok_or_else(|| StoreError::Backend(format!("unknown target kind '{}'", r.target_kind)))?;
        let kind = PendingKind::parse(&r.kind)
            .ok_or_else(|| StoreError::Backend(format!("unknown pending kind '{}'", r.kind)))?;
        Ok(PendingRecord {
            key: PendingKey {
                target,
                tick: r.tick,
                kind,
            },
            expected: r.expected.max(0) as u32,
            current_arrived: r.current_arrived.max(0) as u32,
            past_arrived: r.past_arrived.max(0) as u32,
        })
    }
}

impl TryFrom<AlertRow> for Alert {
    type Error = StoreError;

    fn try_from(r: AlertRow) -> Result<Self, Self::Error> {
        let kind = AlertKind::parse(&r.kind)
            .ok_or_else(|| StoreError::Backend(format!("unknown alert kind '{}'", r.kind)))?;
        Ok(Alert {
            key: r.key,
            zone_id: r.zone_id,
            night: r.night,
            kind,
            loss_amount: r.loss_amount,
            raised_at: r.raised_at,
        })
    }
}

fn map_sqlx(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        match db.code().as_deref() {
            // unique_violation
            Some("23505") => return StoreError::Duplicate(db.message().to_string()),
            // serialization_failure, deadlock_detected
            Some("40001") | Some("40P01") => return StoreError::Contention(db.message().to_string()),
            _ => {}
        }
    }
    if matches!(e, sqlx::Error::PoolTimedOut) {
        return StoreError::Contention(e.to_string());
    }
    StoreError::Backend(e.to_string())
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the reconciliation tables if they do not exist yet.
    pub async fn apply_schema(&self) -> anyhow::Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    async fn apply(tx: &mut Transaction<'_, Postgres>, change: Change) -> Result<(), StoreError> {
        match change {
            Change::InsertPulse(p) => {
                sqlx::query(
                    r#"
                    INSERT INTO pulses (meter_id, ts, raw, raw_value, calibrated, fingerprint, anomaly)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    "#,
                )
                .bind(&p.meter_id)
                .bind(p.ts)
                .bind(&p.raw)
                .bind(p.raw_value)
                .bind(p.calibrated)
                .bind(&p.fingerprint)
                .bind(p.anomaly)
                .execute(&mut **tx)
                .await
                .map_err(map_sqlx)?;
            }
            Change::InsertReading(r) => {
                sqlx::query(
                    r#"
                    INSERT INTO sensor_readings (kind, device_id, ts, raw, calibrated)
                    VALUES ($1, $2, $3, $4, $5)
                    "#,
                )
                .bind(r.kind.as_str())
                .bind(&r.device_id)
                .bind(r.ts)
                .bind(&r.raw)
                .bind(r.calibrated)
                .execute(&mut **tx)
                .await
                .map_err(map_sqlx)?;
            }
            Change::PutPending(rec) => {
                sqlx::query(
                    r#"
                    INSERT INTO pending_reconciliations
                        (target_kind, target_id, tick, kind, expected, current_arrived, past_arrived)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    ON CONFLICT (target_kind, target_id, tick, kind) DO UPDATE
                    SET expected        = EXCLUDED.expected,
                        current_arrived = EXCLUDED.current_arrived,
                        past_arrived    = EXCLUDED.past_arrived
                    "#,
                )
                .bind(rec.key.target.kind_str())
                .bind(rec.key.target.id())
                .bind(rec.key.tick)
                .bind(rec.key.kind.as_str())
                .bind(rec.expected as i32)
                .bind(rec.current_arrived as i32)
                .bind(rec.past_arrived as i32)
                .execute(&mut **tx)
                .await
                .map_err(map_sqlx)?;
            }
            Change::DeletePending(key) => {
                let res = sqlx::query(
                    r#"
                    DELETE FROM pending_reconciliations
                    WHERE target_kind = $1 AND target_id = $2 AND tick = $3 AND kind = $4
                    "#,
                )
                .bind(key.target.kind_str())
                .bind(key.target.id())
                .bind(key.tick)
                .bind(key.kind.as_str())
                .execute(&mut **tx)
                .await
                .map_err(map_sqlx)?;
                if res.rows_affected() == 0 {
                    return Err(StoreError::Contention(format!(
                        "pending {} at {} vanished",
                        key.target, key.tick
                    )));
                }
            }
            Change::Rollup { key, op } => Self::apply_rollup(tx, key, op).await?,
            Change::InsertLossRecord(l) => {
                sqlx::query("INSERT INTO loss_records (zone_id, night, amount) VALUES ($1, $2, $3)")
                    .bind(&l.zone_id)
                    .bind(l.night)
                    .bind(l.amount)
                    .execute(&mut **tx)
                    .await
                    .map_err(map_sqlx)?;
            }
            Change::InsertAlert(a) => {
                sqlx::query(
                    r#"
                    INSERT INTO alerts (key, zone_id, night, kind, loss_amount, raised_at)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    "#,
                )
                .bind(&a.key)
                .bind(&a.zone_id)
                .bind(a.night)
                .bind(a.kind.code())
                .bind(a.loss_amount)
                .bind(a.raised_at)
                .execute(&mut **tx)
                .await
                .map_err(map_sqlx)?;
            }
            Change::SetAnomaly { key, anomaly } => {
                let res = sqlx::query("UPDATE pulses SET anomaly = $3 WHERE meter_id = $1 AND ts = $2")
                    .bind(&key.meter_id)
                    .bind(key.ts)
                    .bind(anomaly)
                    .execute(&mut **tx)
                    .await
                    .map_err(map_sqlx)?;
                if res.rows_affected() == 0 {
                    return Err(StoreError::Conflict(format!("unknown pulse {key}")));
                }
            }
        }
        Ok(())
    }

    async fn apply_rollup(
        tx: &mut Transaction<'_, Postgres>,
        key: RollupKey,
        op: RollupOp,
    ) -> Result<(), StoreError> {
        let sql = match op {
            RollupOp::Set(_) => {
                r#"
                INSERT INTO rollups (series, target_id, resolution, period, value, weight)
                VALUES ($1, $2, $3, $4, $5, 1)
                ON CONFLICT (series, target_id, resolution, period) DO NOTHING
                "#
            }
            RollupOp::Add(_) => {
                r#"
                INSERT INTO rollups (series, target_id, resolution, period, value, weight)
                VALUES ($1, $2, $3, $4, $5, 1)
                ON CONFLICT (series, target_id, resolution, period) DO UPDATE
                SET value  = COALESCE(rollups.value, 0) + EXCLUDED.value,
                    weight = rollups.weight + 1
                "#
            }
            RollupOp::Average { .. } => {
                r#"
                INSERT INTO rollups (series, target_id, resolution, period, value, weight)
                VALUES ($1, $2, $3, $4, $5, 1)
                ON CONFLICT (series, target_id, resolution, period) DO UPDATE
                SET value = CASE
                        WHEN rollups.value IS NULL THEN EXCLUDED.value
                        ELSE (rollups.value * COALESCE($6::BIGINT, rollups.weight) + EXCLUDED.value)
                             / (COALESCE($6::BIGINT, rollups.weight) + 1)
                    END,
                    weight = CASE
                        WHEN rollups.value IS NULL THEN 1
                        ELSE COALESCE($6::BIGINT, rollups.weight) + 1
                    END
                "#
            }
        };

        let (value, seed) = match op {
            RollupOp::Set(v) => (v, None),
            RollupOp::Add(x) => (Some(x), None),
            RollupOp::Average { value, seed } => (Some(value), seed),
        };

        let mut query = sqlx::query(sql)
            .bind(key.series.as_str())
            .bind(&key.target_id)
            .bind(key.resolution.as_str())
            .bind(key.period)
            .bind(value);
        if matches!(op, RollupOp::Average { .. }) {
            query = query.bind(seed);
        }

        let res = query.execute(&mut **tx).await.map_err(map_sqlx)?;
        if matches!(op, RollupOp::Set(_)) && res.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "{} row for {} at {} already written",
                key.series, key.target_id, key.period
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl EntityStore for PgStore {
    async fn pulse(&self, meter_id: &str, ts: OffsetDateTime) -> Result<Option<Pulse>, StoreError> {
        sqlx::query_as::<_, Pulse>(
            r#"
            SELECT meter_id, ts, raw, raw_value, calibrated, fingerprint, anomaly
            FROM pulses
            WHERE meter_id = $1 AND ts = $2
            "#,
        )
        .bind(meter_id)
        .bind(ts)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)
    }

    async fn latest_pulse_before(
        &self,
        meter_id: &str,
        before: OffsetDateTime,
    ) -> Result<Option<Pulse>, StoreError> {
        sqlx::query_as::<_, Pulse>(
            r#"
            SELECT meter_id, ts, raw, raw_value, calibrated, fingerprint, anomaly
            FROM pulses
            WHERE meter_id = $1 AND ts < $2
            ORDER BY ts DESC
            LIMIT 1
            "#,
        )
        .bind(meter_id)
        .bind(before)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)
    }

    async fn pulses_between(
        &self,
        meter_id: &str,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Vec<Pulse>, StoreError> {
        sqlx::query_as::<_, Pulse>(
            r#"
            SELECT meter_id, ts, raw, raw_value, calibrated, fingerprint, anomaly
            FROM pulses
            WHERE meter_id = $1
              AND ts >= $2
              AND ts <  $3
            ORDER BY ts
            "#,
        )
        .bind(meter_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)
    }

    async fn reading(
        &self,
        kind: SensorKind,
        device_id: &str,
        ts: OffsetDateTime,
    ) -> Result<Option<SensorReading>, StoreError> {
        let row = sqlx::query_as::<_, ReadingRow>(
            r#"
            SELECT kind, device_id, ts, raw, calibrated
            FROM sensor_readings
            WHERE kind = $1 AND device_id = $2 AND ts = $3
            "#,
        )
        .bind(kind.as_str())
        .bind(device_id)
        .bind(ts)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row.map(SensorReading::try_from).transpose()
    }

    async fn count_readings(
        &self,
        kind: SensorKind,
        device_ids: &[String],
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<i64, StoreError> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM sensor_readings
            WHERE kind = $1
              AND device_id = ANY($2)
              AND ts >= $3
              AND ts <= $4
            "#,
        )
        .bind(kind.as_str())
        .bind(device_ids)
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)
    }

    async fn pending_for(&self, target: &Target) -> Result<Vec<PendingRecord>, StoreError> {
        let rows = sqlx::query_as::<_, PendingRow>(
            r#"
            SELECT target_kind, target_id, tick, kind, expected, current_arrived, past_arrived
            FROM pending_reconciliations
            WHERE target_kind = $1 AND target_id = $2
            ORDER BY tick, kind
            "#,
        )
        .bind(target.kind_str())
        .bind(target.id())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.into_iter().map(PendingRecord::try_from).collect()
    }

    async fn rollup(&self, key: &RollupKey) -> Result<Option<RollupRow>, StoreError> {
        let row = sqlx::query_as::<_, rollup_queries::RollupProfileRow>(
            r#"
            SELECT series, target_id, resolution, period, value, weight
            FROM rollups
            WHERE series = $1 AND target_id = $2 AND resolution = $3 AND period = $4
            "#,
        )
        .bind(key.series.as_str())
        .bind(&key.target_id)
        .bind(key.resolution.as_str())
        .bind(key.period)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row.map(|r| r.into_row().map_err(|e| StoreError::Backend(e.to_string())))
            .transpose()
    }

    async fn rollups_between(
        &self,
        series: Series,
        target_id: &str,
        resolution: Resolution,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Vec<RollupRow>, StoreError> {
        rollup_queries::rollup_profile(&self.pool, series, target_id, resolution, from, to)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn loss_record(&self, zone_id: &str, night: Date) -> Result<Option<LossRecord>, StoreError> {
        sqlx::query_as::<_, LossRecord>(
            "SELECT zone_id, night, amount FROM loss_records WHERE zone_id = $1 AND night = $2",
        )
        .bind(zone_id)
        .bind(night)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)
    }

    async fn alerts_for(&self, zone_id: &str) -> Result<Vec<Alert>, StoreError> {
        let rows = sqlx::query_as::<_, AlertRow>(
            r#"
            SELECT key, zone_id, night, kind, loss_amount, raised_at
            FROM alerts
            WHERE zone_id = $1
            ORDER BY night, key
            "#,
        )
        .bind(zone_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.into_iter().map(Alert::try_from).collect()
    }

    async fn next_serial(&self, scope: &str) -> Result<i64, StoreError> {
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO serials (scope, last_value) VALUES ($1, 1)
            ON CONFLICT (scope) DO UPDATE SET last_value = serials.last_value + 1
            RETURNING last_value
            "#,
        )
        .bind(scope)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)
    }

    async fn commit(&self, changes: Changeset) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        for change in changes.into_changes() {
            Self::apply(&mut tx, change).await?;
        }
        tx.commit().await.map_err(map_sqlx)
    }
}
