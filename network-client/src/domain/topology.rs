use std::fmt;

use serde::{Deserialize, Serialize};

pub type MeterId = String;
pub type ZoneId = String;
pub type LineId = String;
pub type TransmitterId = String;
pub type SensorId = String;

fn one() -> f64 {
    1.0
}

fn yes() -> bool {
    true
}

/// Linear calibration of a device's raw reading.
///
/// `digits` is the width of a flow meter's counter; when set, a reading that
/// drops below half of the previous one is treated as a counter rollover.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    #[serde(default = "one")]
    pub factor: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub digits: Option<u32>,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            factor: 1.0,
            offset: 0.0,
            digits: None,
        }
    }
}

impl Calibration {
    pub fn apply(&self, raw: f64) -> f64 {
        raw * self.factor + self.offset
    }

    /// Counter capacity (`10^digits`), if the meter rolls over.
    pub fn capacity(&self) -> Option<f64> {
        self.digits.map(|d| 10f64.powi(d as i32))
    }
}

/// A flow meter sitting on a zone border or at one end of a transmission line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meter {
    pub id: MeterId,
    #[serde(flatten)]
    pub calibration: Calibration,
    /// Zone this meter feeds water into.
    #[serde(default)]
    pub input_for: Option<ZoneId>,
    /// Zone this meter takes water out of.
    #[serde(default)]
    pub output_for: Option<ZoneId>,
    #[serde(default)]
    pub line_input: Option<LineId>,
    #[serde(default)]
    pub line_output: Option<LineId>,
}

impl Meter {
    pub fn zones(&self) -> impl Iterator<Item = &ZoneId> {
        self.input_for.iter().chain(self.output_for.iter())
    }

    pub fn lines(&self) -> impl Iterator<Item = &LineId> {
        self.line_input.iter().chain(self.line_output.iter())
    }

    pub fn is_zone_meter(&self) -> bool {
        self.input_for.is_some() || self.output_for.is_some()
    }

    pub fn is_line_meter(&self) -> bool {
        self.line_input.is_some() || self.line_output.is_some()
    }
}

/// A District Metered Area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: ZoneId,
    #[serde(default)]
    pub name: Option<String>,
    /// Expected legitimate consumption rate during the night window (volume per hour).
    #[serde(default)]
    pub legitimate_night_use: f64,
    /// Pressure/leak exponent used by the night-to-day factor.
    #[serde(default = "one")]
    pub n1: f64,
    /// Daily leak volume above which an alert is raised.
    #[serde(default)]
    pub burst_threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransmissionLine {
    pub id: LineId,
    /// Water held by the line itself; daily losses up to this volume are not counted.
    #[serde(default)]
    pub volume: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZonePressureLink {
    pub zone: ZoneId,
    #[serde(default = "one")]
    pub azp_factor: f64,
    #[serde(default = "yes")]
    pub use_for_azp: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PressureTransmitter {
    pub id: TransmitterId,
    #[serde(flatten)]
    pub calibration: Calibration,
    #[serde(default)]
    pub zones: Vec<ZonePressureLink>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChlorineSensor {
    pub id: SensorId,
    #[serde(flatten)]
    pub calibration: Calibration,
}

/// Anything that owns pending reconciliations or rollup rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Target {
    Zone(ZoneId),
    Line(LineId),
    Sensor(SensorId),
}

impl Target {
    pub fn id(&self) -> &str {
        match self {
            Target::Zone(id) | Target::Line(id) | Target::Sensor(id) => id,
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            Target::Zone(_) => "zone",
            Target::Line(_) => "line",
            Target::Sensor(_) => "sensor",
        }
    }

    pub fn from_parts(kind: &str, id: impl Into<String>) -> Option<Self> {
        match kind {
            "zone" => Some(Target::Zone(id.into())),
            "line" => Some(Target::Line(id.into())),
            "sensor" => Some(Target::Sensor(id.into())),
            _ => None,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind_str(), self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calibration_is_linear() {
        let cal = Calibration {
            factor: 2.0,
            offset: 17.0,
            digits: None,
        };
        assert_eq!(cal.apply(30.0), 77.0);
        assert_eq!(cal.capacity(), None);
    }

    #[test]
    fn capacity_follows_digit_count() {
        let cal = Calibration {
            digits: Some(6),
            ..Calibration::default()
        };
        assert_eq!(cal.capacity(), Some(1_000_000.0));
    }

    #[test]
    fn target_round_trips_through_its_parts() {
        let t = Target::Line("tsm-1".to_string());
        assert_eq!(Target::from_parts(t.kind_str(), t.id()), Some(t.clone()));
        assert_eq!(t.to_string(), "line:tsm-1");
        assert_eq!(Target::from_parts("tank", "x"), None);
    }
}
