use network_client::domain::{Calibration, Pulse};
use time::OffsetDateTime;

use super::error::EngineError;

/// Parse a raw field reading; only finite numbers are accepted.
pub fn parse_raw(raw: &str) -> Result<f64, EngineError> {
    let value: f64 = raw
        .trim()
        .parse()
        .map_err(|e| EngineError::InvalidReading(format!("'{raw}' is not numeric: {e}")))?;
    if !value.is_finite() {
        return Err(EngineError::InvalidReading(format!("'{raw}' is not finite")));
    }
    Ok(value)
}

fn hash_str(hasher: &mut blake3::Hasher, s: &str) {
    let len = s.len() as u32;
    hasher.update(&len.to_le_bytes());
    hasher.update(s.as_bytes());
}

/// Stable identity of one submission of a reading.
pub fn fingerprint(meter_id: &str, ts: OffsetDateTime, raw: &str) -> String {
    let mut h = blake3::Hasher::new();
    h.update(&ts.unix_timestamp_nanos().to_le_bytes());
    hash_str(&mut h, meter_id);
    hash_str(&mut h, raw.trim());
    h.finalize().to_hex().to_string()
}

pub fn build_pulse(
    meter_id: &str,
    ts: OffsetDateTime,
    raw: &str,
    calibration: &Calibration,
) -> Result<Pulse, EngineError> {
    let raw_value = parse_raw(raw)?;
    Ok(Pulse {
        meter_id: meter_id.to_string(),
        ts,
        raw: raw.trim().to_string(),
        raw_value,
        calibrated: calibration.apply(raw_value),
        fingerprint: fingerprint(meter_id, ts, raw),
        anomaly: None,
    })
}

/// Calibrated volume that passed through a meter between two of its pulses.
///
/// A counter with a known width that drops below half of the previous raw
/// reading has rolled over once.
pub fn delta(prev: &Pulse, cur: &Pulse, calibration: &Calibration) -> f64 {
    match calibration.capacity() {
        Some(capacity) if cur.raw_value < prev.raw_value / 2.0 => {
            calibration.apply(capacity + cur.raw_value) - prev.calibrated
        }
        _ => cur.calibrated - prev.calibrated,
    }
}

pub fn consumption_between(
    prev: Option<&Pulse>,
    cur: &Pulse,
    calibration: &Calibration,
) -> Result<f64, EngineError> {
    let prev = prev.ok_or_else(|| EngineError::MissingBaseline {
        meter_id: cur.meter_id.clone(),
        ts: cur.ts,
    })?;
    Ok(delta(prev, cur, calibration))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn cal(factor: f64, offset: f64, digits: Option<u32>) -> Calibration {
        Calibration {
            factor,
            offset,
            digits,
        }
    }

    #[test]
    fn calibrates_linearly() {
        let c = cal(2.0, 17.0, None);
        let p = build_pulse("mtr-4", datetime!(2020-03-05 17:15:00 UTC), " 30 ", &c).unwrap();
        assert_eq!(p.raw, "30");
        assert_eq!(p.raw_value, 30.0);
        assert_eq!(p.calibrated, 77.0);
    }

    #[test]
    fn rejects_non_numeric_and_non_finite() {
        assert!(matches!(parse_raw("abc"), Err(EngineError::InvalidReading(_))));
        assert!(matches!(parse_raw("NaN"), Err(EngineError::InvalidReading(_))));
        assert!(matches!(parse_raw("inf"), Err(EngineError::InvalidReading(_))));
    }

    #[test]
    fn rollover_adds_counter_capacity() {
        let c = cal(1.0, 0.0, Some(6));
        let t = datetime!(2020-03-05 17:15:00 UTC);
        let prev = build_pulse("m", t, "999990", &c).unwrap();
        let cur = build_pulse("m", t + time::Duration::minutes(15), "15", &c).unwrap();
        assert_eq!(delta(&prev, &cur, &c), 25.0);
    }

    #[test]
    fn small_decrease_is_not_a_rollover() {
        let c = cal(1.0, 0.0, Some(6));
        let t = datetime!(2020-03-05 17:15:00 UTC);
        let prev = build_pulse("m", t, "1000", &c).unwrap();
        let cur = build_pulse("m", t + time::Duration::minutes(15), "990", &c).unwrap();
        assert_eq!(delta(&prev, &cur, &c), -10.0);
    }

    #[test]
    fn without_baseline_there_is_no_delta() {
        let c = cal(1.0, 0.0, None);
        let cur = build_pulse("m", datetime!(2020-03-05 17:15:00 UTC), "5", &c).unwrap();
        assert!(matches!(
            consumption_between(None, &cur, &c),
            Err(EngineError::MissingBaseline { .. })
        ));
    }

    #[test]
    fn fingerprint_ignores_padding_only() {
        let t = datetime!(2020-03-05 17:15:00 UTC);
        assert_eq!(fingerprint("m", t, "30"), fingerprint("m", t, " 30"));
        assert_ne!(fingerprint("m", t, "30"), fingerprint("m", t, "31"));
    }
}
