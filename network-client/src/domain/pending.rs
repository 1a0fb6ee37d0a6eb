use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::topology::Target;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingKind {
    ZoneConsumption,
    LineInflow,
    LineLoss,
}

impl PendingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingKind::ZoneConsumption => "zone_consumption",
            PendingKind::LineInflow => "line_inflow",
            PendingKind::LineLoss => "line_loss",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "zone_consumption" => Some(PendingKind::ZoneConsumption),
            "line_inflow" => Some(PendingKind::LineInflow),
            "line_loss" => Some(PendingKind::LineLoss),
            _ => None,
        }
    }
}

/// Identity of a pending reconciliation.
///
/// For zone consumption and line inflow `tick` is the instant closing the
/// window. For line loss it is midnight of the day being reconciled.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PendingKey {
    pub target: Target,
    #[serde(with = "time::serde::rfc3339")]
    pub tick: OffsetDateTime,
    pub kind: PendingKind,
}

/// Join state for a window whose sister pulses have not all arrived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRecord {
    pub key: PendingKey,
    pub expected: u32,
    pub current_arrived: u32,
    pub past_arrived: u32,
}

impl PendingRecord {
    pub fn new(key: PendingKey, expected: u32, current_arrived: u32, past_arrived: u32) -> Self {
        Self {
            key,
            expected,
            current_arrived,
            past_arrived,
        }
    }

    /// Pulses still missing across both the current and the past group.
    pub fn missing(&self) -> u32 {
        self.expected.saturating_sub(self.current_arrived)
            + self.expected.saturating_sub(self.past_arrived)
    }

    pub fn is_complete(&self) -> bool {
        self.missing() == 0
    }

    pub fn current_complete(&self) -> bool {
        self.current_arrived >= self.expected
    }

    pub fn past_complete(&self) -> bool {
        self.past_arrived >= self.expected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn key() -> PendingKey {
        PendingKey {
            target: Target::Zone("red".to_string()),
            tick: datetime!(2020-03-05 17:15:00 UTC),
            kind: PendingKind::ZoneConsumption,
        }
    }

    #[test]
    fn missing_counts_both_groups() {
        let rec = PendingRecord::new(key(), 2, 2, 0);
        assert_eq!(rec.missing(), 2);
        assert!(rec.current_complete());
        assert!(!rec.past_complete());
        assert!(!rec.is_complete());
    }

    #[test]
    fn missing_never_goes_negative() {
        let rec = PendingRecord::new(key(), 1, 3, 1);
        assert_eq!(rec.missing(), 0);
    }
}
