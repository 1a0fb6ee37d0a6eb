use anyhow::{anyhow, Result};
use sqlx::PgPool;
use time::{Date, OffsetDateTime};

use crate::domain::{Resolution, RollupKey, RollupRow, Series};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RollupProfileRow {
    pub series: String,
    pub target_id: String,
    pub resolution: String,
    pub period: OffsetDateTime,
    pub value: Option<f64>,
    pub weight: i64,
}

impl RollupProfileRow {
    pub fn into_row(self) -> Result<RollupRow> {
        let series = Series::parse(&self.series)
            .ok_or_else(|| anyhow!("unknown series '{}' in rollups", self.series))?;
        let resolution = Resolution::parse(&self.resolution)
            .ok_or_else(|| anyhow!("unknown resolution '{}' in rollups", self.resolution))?;
        Ok(RollupRow {
            key: RollupKey::new(series, self.target_id, resolution, self.period),
            value: self.value,
            weight: self.weight,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ZoneLossTotal {
    pub zone_id: String,
    pub nights: i64,
    pub total_loss: f64,
}

/// Fetch a time-ordered profile of one series for a single target.
pub async fn rollup_profile(
    pool: &PgPool,
    series: Series,
    target_id: &str,
    resolution: Resolution,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> Result<Vec<RollupRow>> {
    let rows = sqlx::query_as::<_, RollupProfileRow>(
        r#"
        SELECT
            series,
            target_id,
            resolution,
            period,
            value,
            weight
        FROM rollups
        WHERE series = $1
          AND target_id = $2
          AND resolution = $3
          AND period >= $4
          AND period <  $5
        ORDER BY period
        "#,
    )
    .bind(series.as_str())
    .bind(target_id)
    .bind(resolution.as_str())
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(RollupProfileRow::into_row).collect()
}

/// Estimated leak volume per zone over a range of nights.
pub async fn zone_loss_totals(
    pool: &PgPool,
    zones: &[String],
    start: Date,
    end: Date,
) -> Result<Vec<ZoneLossTotal>> {
    let rows = sqlx::query_as::<_, ZoneLossTotal>(
        r#"
        SELECT
            zone_id,
            COUNT(*)    AS nights,
            SUM(amount) AS total_loss
        FROM loss_records
        WHERE night >= $1
          AND night <  $2
          AND zone_id = ANY($3)
        GROUP BY zone_id
        ORDER BY zone_id
        "#,
    )
    .bind(start)
    .bind(end)
    .bind(zones)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
