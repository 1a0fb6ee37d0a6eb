//! Fixed 15-minute reconciliation grid.

use time::{Date, Duration, OffsetDateTime, UtcOffset};

/// Reading interval epoch.
pub const RIE: Duration = Duration::minutes(15);

/// Drop seconds and sub-seconds and move to UTC.
pub fn truncate_to_minute(ts: OffsetDateTime) -> OffsetDateTime {
    let ts = ts.to_offset(UtcOffset::UTC);
    ts - Duration::seconds(ts.second() as i64) - Duration::nanoseconds(ts.nanosecond() as i64)
}

pub fn is_aligned(ts: OffsetDateTime) -> bool {
    ts.second() == 0 && ts.nanosecond() == 0 && ts.minute() % 15 == 0
}

/// Start of the window a reading at `ts` closes.
pub fn offset_time(ts: OffsetDateTime) -> OffsetDateTime {
    ts - RIE
}

pub fn is_midnight(ts: OffsetDateTime) -> bool {
    let ts = ts.to_offset(UtcOffset::UTC);
    ts.hour() == 0 && ts.minute() == 0
}

pub fn day_start(day: Date) -> OffsetDateTime {
    day.midnight().assume_utc()
}

/// First tick of `day`, opening a transmission line's daily loss window.
pub fn kickoff(day: Date) -> OffsetDateTime {
    day_start(day) + RIE
}

/// Midnight closing `day`.
pub fn closure(day: Date) -> OffsetDateTime {
    day_start(day) + Duration::days(1)
}

pub fn hour_start(ts: OffsetDateTime) -> OffsetDateTime {
    let ts = truncate_to_minute(ts);
    ts - Duration::minutes(ts.minute() as i64)
}

/// Ticks `t` with `start < t <= end`.
pub fn ticks_between(start: OffsetDateTime, end: OffsetDateTime) -> Vec<OffsetDateTime> {
    let mut out = Vec::new();
    let mut t = start + RIE;
    while t <= end {
        out.push(t);
        t += RIE;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime};

    #[test]
    fn truncation_keeps_the_minute() {
        let ts = datetime!(2020-03-05 17:15:42.5 UTC);
        assert_eq!(truncate_to_minute(ts), datetime!(2020-03-05 17:15:00 UTC));
        assert!(is_aligned(truncate_to_minute(ts)));
        assert!(!is_aligned(datetime!(2020-03-05 17:16:00 UTC)));
    }

    #[test]
    fn loss_window_bounds() {
        let day = date!(2020-03-05);
        assert_eq!(kickoff(day), datetime!(2020-03-05 00:15:00 UTC));
        assert_eq!(closure(day), datetime!(2020-03-06 00:00:00 UTC));
        assert!(is_midnight(closure(day)));
        assert!(!is_midnight(kickoff(day)));
    }

    #[test]
    fn ticks_between_excludes_start() {
        let ticks = ticks_between(
            datetime!(2020-03-05 10:00:00 UTC),
            datetime!(2020-03-05 10:45:00 UTC),
        );
        assert_eq!(
            ticks,
            vec![
                datetime!(2020-03-05 10:15:00 UTC),
                datetime!(2020-03-05 10:30:00 UTC),
                datetime!(2020-03-05 10:45:00 UTC),
            ]
        );
        assert!(ticks_between(ticks[2], ticks[2]).is_empty());
    }

    #[test]
    fn hour_start_of_quarter() {
        assert_eq!(
            hour_start(datetime!(2020-03-05 02:45:00 UTC)),
            datetime!(2020-03-05 02:00:00 UTC)
        );
    }
}
