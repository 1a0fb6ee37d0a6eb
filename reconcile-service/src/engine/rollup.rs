//! Incremental rollups: quarter-hour rows are written once, coarser rows
//! accumulate what their quarter-hours contribute.

use network_client::{
    db::RollupOp,
    domain::{Resolution, RollupKey, Series},
};
use serde::Serialize;
use time::{Date, OffsetDateTime};

use super::{error::EngineError, ticks, unit_of_work::UnitOfWork};

/// A window whose value was settled during a unit of work.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciledWindow {
    pub series: Series,
    pub target_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
    /// `None` when no baseline existed to take a delta from.
    pub value: Option<f64>,
}

const COARSE: [Resolution; 3] = [Resolution::Day, Resolution::Month, Resolution::Year];

/// Record the value of the quarter-hour window `[start, end]`.
///
/// The row is keyed by `end`; Day/Month/Year rows are keyed by the period
/// holding `start`, so a window closing at midnight counts towards the day
/// it started in. Returns `None` when the window was already written.
pub async fn accumulate_window(
    uow: &mut UnitOfWork<'_>,
    series: Series,
    target_id: &str,
    start: OffsetDateTime,
    end: OffsetDateTime,
    value: Option<f64>,
) -> Result<Option<ReconciledWindow>, EngineError> {
    let qh = RollupKey::new(series, target_id, Resolution::QuarterHour, end);
    if uow.quarter_hour_exists(&qh).await? {
        tracing::warn!(
            series = %series,
            target = %target_id,
            tick = %end,
            "quarter-hour already reconciled, skipping"
        );
        metrics::counter!("reconcile_windows_skipped_total").increment(1);
        return Ok(None);
    }

    uow.rollup(qh, RollupOp::Set(value));
    if let Some(v) = value {
        for res in COARSE {
            uow.rollup(RollupKey::containing(series, target_id, res, start), RollupOp::Add(v));
        }
    }

    Ok(Some(ReconciledWindow {
        series,
        target_id: target_id.to_string(),
        start,
        end,
        value,
    }))
}

/// Add a daily amount (line loss, zone leak) to the Day/Month/Year rows of `day`.
pub fn accumulate_daily(uow: &mut UnitOfWork<'_>, series: Series, target_id: &str, day: Date, value: f64) {
    let at = ticks::day_start(day);
    for res in COARSE {
        uow.rollup(RollupKey::containing(series, target_id, res, at), RollupOp::Add(value));
    }
}

/// Split `total` evenly over the ticks after `base` up to and including `end`.
pub fn split_evenly(base: OffsetDateTime, end: OffsetDateTime, total: f64) -> Vec<(OffsetDateTime, f64)> {
    let ticks = ticks::ticks_between(base, end);
    if ticks.is_empty() {
        return Vec::new();
    }
    let share = total / ticks.len() as f64;
    ticks.into_iter().map(|t| (t, share)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use network_client::db::{Change, EntityStore, MemoryStore};
    use time::macros::{date, datetime};

    #[tokio::test]
    async fn midnight_window_counts_towards_the_day_it_started() {
        let store = MemoryStore::new();
        let mut uow = UnitOfWork::new(&store);
        let end = datetime!(2020-03-06 00:00:00 UTC);

        let w = accumulate_window(&mut uow, Series::ZoneConsumption, "red", end - ticks::RIE, end, Some(5.0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(w.value, Some(5.0));
        store.commit(uow.finish()).await.unwrap();

        let qh = store
            .rollup(&RollupKey::new(Series::ZoneConsumption, "red", Resolution::QuarterHour, end))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(qh.value, Some(5.0));

        let day = store
            .rollup(&RollupKey::new(
                Series::ZoneConsumption,
                "red",
                Resolution::Day,
                datetime!(2020-03-05 00:00:00 UTC),
            ))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(day.value, Some(5.0));
    }

    #[tokio::test]
    async fn null_window_leaves_coarse_rows_alone() {
        let store = MemoryStore::new();
        let mut uow = UnitOfWork::new(&store);
        let end = datetime!(2020-03-05 10:15:00 UTC);

        accumulate_window(&mut uow, Series::ZoneConsumption, "red", end - ticks::RIE, end, None)
            .await
            .unwrap();
        let cs = uow.finish();
        assert_eq!(cs.len(), 1);
        assert!(matches!(
            cs.iter().next(),
            Some(Change::Rollup { op: RollupOp::Set(None), .. })
        ));
    }

    #[tokio::test]
    async fn second_write_of_a_window_is_skipped() {
        let store = MemoryStore::new();
        let mut uow = UnitOfWork::new(&store);
        let end = datetime!(2020-03-05 10:15:00 UTC);

        assert!(accumulate_window(&mut uow, Series::LineInflow, "tsm", end - ticks::RIE, end, Some(1.0))
            .await
            .unwrap()
            .is_some());
        assert!(accumulate_window(&mut uow, Series::LineInflow, "tsm", end - ticks::RIE, end, Some(1.0))
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn daily_amount_reaches_month_and_year() {
        let store = MemoryStore::new();
        let mut uow = UnitOfWork::new(&store);
        accumulate_daily(&mut uow, Series::LineLoss, "tsm", date!(2020-03-05), 3.0);

        let periods: Vec<_> = uow
            .finish()
            .iter()
            .filter_map(|c| match c {
                Change::Rollup { key, .. } => Some((key.resolution, key.period)),
                _ => None,
            })
            .collect();
        assert!(periods.contains(&(Resolution::Day, datetime!(2020-03-05 00:00:00 UTC))));
        assert!(periods.contains(&(Resolution::Month, datetime!(2020-03-01 00:00:00 UTC))));
        assert!(periods.contains(&(Resolution::Year, datetime!(2020-01-01 00:00:00 UTC))));
    }

    #[test]
    fn gap_is_split_evenly() {
        let parts = split_evenly(
            datetime!(2020-03-05 10:00:00 UTC),
            datetime!(2020-03-05 10:45:00 UTC),
            90.0,
        );
        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(|(_, v)| *v == 30.0));
        assert_eq!(parts[2].0, datetime!(2020-03-05 10:45:00 UTC));
    }
}
