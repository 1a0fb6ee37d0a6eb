use std::fmt;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime, UtcOffset};

/// Quantity tracked by a family of rollup rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Series {
    ZoneConsumption,
    ZoneLoss,
    LineInflow,
    LineLoss,
    ZonePressure,
    ChlorineLevel,
}

impl Series {
    pub fn as_str(&self) -> &'static str {
        match self {
            Series::ZoneConsumption => "zone_consumption",
            Series::ZoneLoss => "zone_loss",
            Series::LineInflow => "line_inflow",
            Series::LineLoss => "line_loss",
            Series::ZonePressure => "zone_pressure",
            Series::ChlorineLevel => "chlorine_level",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "zone_consumption" => Some(Series::ZoneConsumption),
            "zone_loss" => Some(Series::ZoneLoss),
            "line_inflow" => Some(Series::LineInflow),
            "line_loss" => Some(Series::LineLoss),
            "zone_pressure" => Some(Series::ZonePressure),
            "chlorine_level" => Some(Series::ChlorineLevel),
            _ => None,
        }
    }

    /// Averaged series keep a running weight; the others are sums.
    pub fn is_average(&self) -> bool {
        matches!(self, Series::ZonePressure | Series::ChlorineLevel)
    }

    pub fn supports(&self, resolution: Resolution) -> bool {
        use Resolution::*;
        match self {
            Series::ZoneConsumption | Series::LineInflow => {
                matches!(resolution, QuarterHour | Day | Month | Year)
            }
            Series::ZoneLoss | Series::LineLoss => matches!(resolution, Day | Month | Year),
            Series::ZonePressure | Series::ChlorineLevel => {
                matches!(resolution, Hour | Day | Month | Year)
            }
        }
    }
}

impl fmt::Display for Series {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    QuarterHour,
    Hour,
    Day,
    Month,
    Year,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::QuarterHour => "quarter_hour",
            Resolution::Hour => "hour",
            Resolution::Day => "day",
            Resolution::Month => "month",
            Resolution::Year => "year",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "quarter_hour" => Some(Resolution::QuarterHour),
            "hour" => Some(Resolution::Hour),
            "day" => Some(Resolution::Day),
            "month" => Some(Resolution::Month),
            "year" => Some(Resolution::Year),
            _ => None,
        }
    }

    /// Start of the UTC period of this resolution containing `ts`.
    pub fn period_start(&self, ts: OffsetDateTime) -> OffsetDateTime {
        let ts = ts.to_offset(UtcOffset::UTC);
        let midnight = ts.date().midnight().assume_utc();
        match self {
            Resolution::QuarterHour => {
                midnight
                    + Duration::hours(ts.hour() as i64)
                    + Duration::minutes((ts.minute() as i64 / 15) * 15)
            }
            Resolution::Hour => midnight + Duration::hours(ts.hour() as i64),
            Resolution::Day => midnight,
            Resolution::Month => midnight - Duration::days(ts.day() as i64 - 1),
            Resolution::Year => midnight - Duration::days(ts.ordinal() as i64 - 1),
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quarter-hour rows are keyed by the tick closing the window; every other
/// resolution by the start of its period.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RollupKey {
    pub series: Series,
    pub target_id: String,
    pub resolution: Resolution,
    #[serde(with = "time::serde::rfc3339")]
    pub period: OffsetDateTime,
}

impl RollupKey {
    pub fn new(series: Series, target_id: impl Into<String>, resolution: Resolution, period: OffsetDateTime) -> Self {
        Self {
            series,
            target_id: target_id.into(),
            resolution,
            period,
        }
    }

    /// Key of the period of `resolution` containing `at`.
    pub fn containing(series: Series, target_id: impl Into<String>, resolution: Resolution, at: OffsetDateTime) -> Self {
        Self::new(series, target_id, resolution, resolution.period_start(at))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupRow {
    pub key: RollupKey,
    pub value: Option<f64>,
    pub weight: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn period_starts_are_utc_boundaries() {
        let ts = datetime!(2020-03-05 17:44:59 UTC);
        assert_eq!(Resolution::QuarterHour.period_start(ts), datetime!(2020-03-05 17:30:00 UTC));
        assert_eq!(Resolution::Hour.period_start(ts), datetime!(2020-03-05 17:00:00 UTC));
        assert_eq!(Resolution::Day.period_start(ts), datetime!(2020-03-05 00:00:00 UTC));
        assert_eq!(Resolution::Month.period_start(ts), datetime!(2020-03-01 00:00:00 UTC));
        assert_eq!(Resolution::Year.period_start(ts), datetime!(2020-01-01 00:00:00 UTC));
    }

    #[test]
    fn period_start_normalizes_offsets() {
        let ts = datetime!(2020-03-06 01:30:00 +03:00);
        assert_eq!(Resolution::Day.period_start(ts), datetime!(2020-03-05 00:00:00 UTC));
    }

    #[test]
    fn losses_have_no_intraday_rows() {
        assert!(!Series::LineLoss.supports(Resolution::QuarterHour));
        assert!(!Series::ZonePressure.supports(Resolution::QuarterHour));
        assert!(Series::ZonePressure.supports(Resolution::Hour));
        assert!(Series::ZoneConsumption.supports(Resolution::Year));
    }
}
