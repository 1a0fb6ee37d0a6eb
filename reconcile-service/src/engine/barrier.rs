//! Matching of arriving pulses against pending reconciliation records.

use std::fmt;

use network_client::domain::{Network, PendingKind, PendingRecord, Target};
use time::OffsetDateTime;

use super::{error::EngineError, ticks};

/// Which sister group of a pending record a pulse fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Pulses at the tick closing the window.
    Current,
    /// Pulses at the tick opening the window.
    Past,
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Current => f.write_str("current"),
            Slot::Past => f.write_str("past"),
        }
    }
}

/// A record still short of past pulses takes one from the previous tick
/// before anything else; otherwise only a pulse at its own tick matches.
pub fn zone_slot(rec: &PendingRecord, ts: OffsetDateTime) -> Option<Slot> {
    if !rec.past_complete() && ts + ticks::RIE == rec.key.tick {
        return Some(Slot::Past);
    }
    (ts == rec.key.tick).then_some(Slot::Current)
}

/// Inflow records wait on the output meter's pulse one tick back, nothing else.
pub fn inflow_slot(rec: &PendingRecord, ts: OffsetDateTime, from_output: bool) -> Option<Slot> {
    (from_output && ts == ticks::offset_time(rec.key.tick)).then_some(Slot::Past)
}

/// Loss records wait on the kickoff and closure pulses of their day. Matching
/// is by exact instant, so a matched pulse always dates from the record's day
/// or the midnight after it.
pub fn loss_slot(rec: &PendingRecord, ts: OffsetDateTime) -> Option<Slot> {
    let day = rec.key.tick.date();
    if ts == ticks::kickoff(day) {
        Some(Slot::Past)
    } else if ts == ticks::closure(day) {
        Some(Slot::Current)
    } else {
        None
    }
}

/// Count a matched pulse, refusing to push a group past its expected size.
pub fn register(rec: &mut PendingRecord, slot: Slot, meter_id: &str) -> Result<(), EngineError> {
    let counter = match slot {
        Slot::Current => &mut rec.current_arrived,
        Slot::Past => &mut rec.past_arrived,
    };
    if *counter >= rec.expected {
        return Err(EngineError::InconsistentMatch(format!(
            "{slot} pulse from '{meter_id}' overflows {:?} record of {} at {} ({} expected)",
            rec.key.kind, rec.key.target, rec.key.tick, rec.expected
        )));
    }
    *counter += 1;
    Ok(())
}

/// The pulse's meter must border the record's target, with the right role.
pub fn ensure_member(network: &Network, rec: &PendingRecord, meter_id: &str) -> Result<(), EngineError> {
    let ok = match (&rec.key.target, rec.key.kind) {
        (Target::Zone(zone), PendingKind::ZoneConsumption) => network
            .meter(meter_id)
            .map(|m| m.zones().any(|z| z == zone))
            .unwrap_or(false),
        (Target::Line(line), PendingKind::LineInflow) => network
            .line_ends(line)
            .map(|ends| ends.output == meter_id)
            .unwrap_or(false),
        (Target::Line(line), PendingKind::LineLoss) => network
            .line_ends(line)
            .map(|ends| ends.contains(meter_id))
            .unwrap_or(false),
        _ => false,
    };

    if ok {
        Ok(())
    } else {
        Err(EngineError::InconsistentMatch(format!(
            "meter '{meter_id}' is not part of {:?} record of {} at {}",
            rec.key.kind, rec.key.target, rec.key.tick
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use network_client::domain::PendingKey;
    use time::macros::datetime;

    fn record(target: Target, tick: OffsetDateTime, kind: PendingKind, expected: u32) -> PendingRecord {
        PendingRecord::new(PendingKey { target, tick, kind }, expected, 0, 0)
    }

    #[test]
    fn zone_record_takes_previous_tick_as_past() {
        let t = datetime!(2020-03-05 17:30:00 UTC);
        let mut rec = record(Target::Zone("red".into()), t, PendingKind::ZoneConsumption, 2);
        rec.current_arrived = 1;

        assert_eq!(zone_slot(&rec, t - ticks::RIE), Some(Slot::Past));
        assert_eq!(zone_slot(&rec, t), Some(Slot::Current));
        assert_eq!(zone_slot(&rec, t + ticks::RIE), None);

        rec.past_arrived = 2;
        assert_eq!(zone_slot(&rec, t - ticks::RIE), None);
    }

    #[test]
    fn inflow_record_ignores_input_meter() {
        let t = datetime!(2020-03-05 00:30:00 UTC);
        let rec = record(Target::Line("tsm".into()), t, PendingKind::LineInflow, 1);
        assert_eq!(inflow_slot(&rec, t - ticks::RIE, true), Some(Slot::Past));
        assert_eq!(inflow_slot(&rec, t - ticks::RIE, false), None);
        assert_eq!(inflow_slot(&rec, t, true), None);
    }

    #[test]
    fn loss_record_matches_kickoff_and_closure_only() {
        let day = datetime!(2020-03-05 00:00:00 UTC);
        let rec = record(Target::Line("tsm".into()), day, PendingKind::LineLoss, 2);

        assert_eq!(loss_slot(&rec, datetime!(2020-03-05 00:15:00 UTC)), Some(Slot::Past));
        assert_eq!(loss_slot(&rec, datetime!(2020-03-06 00:00:00 UTC)), Some(Slot::Current));
        assert_eq!(loss_slot(&rec, datetime!(2020-03-05 00:30:00 UTC)), None);
        assert_eq!(loss_slot(&rec, datetime!(2020-03-05 00:00:00 UTC)), None);
        // Kickoff and closure of neighbouring days belong to other records.
        assert_eq!(loss_slot(&rec, datetime!(2020-03-06 00:15:00 UTC)), None);
        assert_eq!(loss_slot(&rec, datetime!(2020-03-04 00:15:00 UTC)), None);
    }

    #[test]
    fn register_refuses_overflow() {
        let mut rec = record(
            Target::Zone("red".into()),
            datetime!(2020-03-05 17:30:00 UTC),
            PendingKind::ZoneConsumption,
            1,
        );
        register(&mut rec, Slot::Current, "m").unwrap();
        assert_eq!(rec.missing(), 1);
        let err = register(&mut rec, Slot::Current, "m").unwrap_err();
        assert!(matches!(err, EngineError::InconsistentMatch(_)));
        assert!(err.is_fatal());
    }
}
