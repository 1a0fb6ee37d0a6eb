use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// An immutable flow meter reading.
///
/// `calibrated` is derived once when the pulse is recorded and never recomputed.
/// `fingerprint` identifies the exact submission so that a byte-identical resend
/// can be told apart from a conflicting one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Pulse {
    pub meter_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub raw: String,
    pub raw_value: f64,
    pub calibrated: f64,
    pub fingerprint: String,
    pub anomaly: Option<bool>,
}

impl Pulse {
    pub fn key(&self) -> PulseKey {
        PulseKey {
            meter_id: self.meter_id.clone(),
            ts: self.ts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PulseKey {
    pub meter_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
}

impl fmt::Display for PulseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.meter_id, self.ts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    Pressure,
    Chlorine,
}

impl SensorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorKind::Pressure => "pressure",
            SensorKind::Chlorine => "chlorine",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pressure" => Some(SensorKind::Pressure),
            "chlorine" => Some(SensorKind::Chlorine),
            _ => None,
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single pressure or chlorine sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub kind: SensorKind,
    pub device_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub raw: String,
    pub calibrated: f64,
}
