use time::Date;

/// Serial scope shared by every alert of one day.
pub fn alert_scope(day: Date) -> String {
    format!("alert-{}", yymmdd(day))
}

/// `ALERT-yymmdd-nnn`.
pub fn alert_key(day: Date, serial: i64) -> String {
    format!("ALERT-{}-{serial:03}", yymmdd(day))
}

fn yymmdd(day: Date) -> String {
    format!(
        "{:02}{:02}{:02}",
        day.year().rem_euclid(100),
        u8::from(day.month()),
        day.day()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn alert_keys_are_zero_padded() {
        assert_eq!(alert_key(date!(2020-03-05), 1), "ALERT-200305-001");
        assert_eq!(alert_key(date!(2021-11-30), 42), "ALERT-211130-042");
        assert_eq!(alert_scope(date!(2020-03-05)), "alert-200305");
    }
}
