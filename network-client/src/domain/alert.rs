use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertKind {
    #[serde(rename = "LK")]
    Leak,
}

impl AlertKind {
    pub fn code(&self) -> &'static str {
        match self {
            AlertKind::Leak => "LK",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "LK" => Some(AlertKind::Leak),
            _ => None,
        }
    }
}

/// Raised when a zone's estimated daily leak exceeds its burst threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Human readable key, `ALERT-yymmdd-nnn`.
    pub key: String,
    pub zone_id: String,
    pub night: Date,
    pub kind: AlertKind,
    /// Estimated leak above the threshold.
    pub loss_amount: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub raised_at: OffsetDateTime,
}

/// Estimated leak volume of a zone for one day, recorded every determinate night.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LossRecord {
    pub zone_id: String,
    pub night: Date,
    pub amount: f64,
}
