use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::pulse::SensorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Flow,
    Pressure,
    Chlorine,
}

impl DeviceKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "flow" => Some(DeviceKind::Flow),
            "pressure" => Some(DeviceKind::Pressure),
            "chlorine" => Some(DeviceKind::Chlorine),
            _ => None,
        }
    }

    pub fn sensor_kind(&self) -> Option<SensorKind> {
        match self {
            DeviceKind::Flow => None,
            DeviceKind::Pressure => Some(SensorKind::Pressure),
            DeviceKind::Chlorine => Some(SensorKind::Chlorine),
        }
    }
}

/// A reading as received from the field, before calibration.
///
/// `raw` is kept as text; calibration parses it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawReading {
    pub kind: DeviceKind,
    pub device_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub raw: String,
}
