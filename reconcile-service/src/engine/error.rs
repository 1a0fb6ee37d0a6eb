use network_client::{
    db::StoreError,
    domain::{AssociationError, Resolution, SensorKind, Series},
};
use time::{Date, OffsetDateTime};

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    /// No earlier pulse to take a delta from.
    #[error("no baseline pulse for meter '{meter_id}' before {ts}")]
    MissingBaseline { meter_id: String, ts: OffsetDateTime },
    /// A pulse matched a pending record it has no association with.
    #[error("inconsistent match: {0}")]
    InconsistentMatch(String),
    #[error("leak estimate for zone '{zone_id}' night {night} is indeterminate: {reason}")]
    IndeterminateLeakEstimate {
        zone_id: String,
        night: Date,
        reason: String,
    },
    #[error("invalid association: {0}")]
    InvalidAssociation(#[from] AssociationError),
    #[error("unknown device '{0}'")]
    UnknownDevice(String),
    #[error("invalid reading: {0}")]
    InvalidReading(String),
    /// Byte-identical resubmission of a recorded pulse.
    #[error("pulse {meter_id}@{ts} already recorded")]
    DuplicatePulse { meter_id: String, ts: OffsetDateTime },
    /// A different reading already exists for the same meter and instant.
    #[error("pulse {meter_id}@{ts} conflicts with the recorded reading")]
    ConflictingPulse { meter_id: String, ts: OffsetDateTime },
    #[error("{kind} reading {device_id}@{ts} already recorded")]
    DuplicateReading {
        kind: SensorKind,
        device_id: String,
        ts: OffsetDateTime,
    },
    #[error("no {series} {resolution} aggregate for '{target_id}' at {period}")]
    NotFound {
        series: Series,
        target_id: String,
        resolution: Resolution,
        period: OffsetDateTime,
    },
    #[error("{series} has no {resolution} aggregates")]
    UnsupportedResolution { series: Series, resolution: Resolution },
    #[error("leak for zone '{zone_id}' night {night} already estimated")]
    AlreadyEstimated { zone_id: String, night: Date },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Worth re-running the whole unit of work.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Store(e) if e.is_transient())
    }

    /// Points at a logic or data-integrity defect rather than bad input.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::InconsistentMatch(_) | EngineError::InvalidAssociation(_)
        )
    }
}
