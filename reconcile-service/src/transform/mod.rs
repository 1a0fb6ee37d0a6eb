use network_client::domain::RawReading;
use time::macros::datetime;

use crate::{
    engine::{normalizer, ticks},
    pipeline::{Envelope, PipelineError, Transform},
};

/// Pure validation of a field reading.
///
/// Rules:
/// - device id must be present.
/// - ts must be within a broad sanity window [2000-01-01, 2100-01-01].
/// - ts, once truncated to the minute, must sit on the 15-minute grid.
/// - raw must be a finite, non-negative number.
///
/// Accepted readings come out with their timestamp truncated to the minute.
pub fn validate_reading(mut env: Envelope<RawReading>) -> Result<Envelope<RawReading>, PipelineError> {
    let r = &mut env.payload;

    if r.device_id.trim().is_empty() {
        return Err(PipelineError::Transform("device_id must not be empty".to_string()));
    }

    let min_ts = datetime!(2000-01-01 00:00:00 UTC);
    let max_ts = datetime!(2100-01-01 00:00:00 UTC);

    if r.ts < min_ts || r.ts > max_ts {
        return Err(PipelineError::Transform("timestamp out of allowed range".to_string()));
    }

    r.ts = ticks::truncate_to_minute(r.ts);
    if !ticks::is_aligned(r.ts) {
        return Err(PipelineError::Transform(format!(
            "timestamp {} is not on the 15-minute grid",
            r.ts
        )));
    }

    let value = normalizer::parse_raw(&r.raw).map_err(|e| PipelineError::Transform(e.to_string()))?;
    if value < 0.0 {
        return Err(PipelineError::Transform("raw reading must be non-negative".to_string()));
    }

    Ok(env)
}

#[derive(Clone, Default)]
pub struct ReadingValidation;

#[async_trait::async_trait]
impl Transform<RawReading, RawReading> for ReadingValidation {
    async fn apply(&self, input: Envelope<RawReading>) -> Result<Envelope<RawReading>, PipelineError> {
        let device = input.payload.device_id.clone();
        match validate_reading(input) {
            Ok(env) => Ok(env),
            Err(e) => {
                metrics::counter!("validation_readings_rejected_total").increment(1);
                tracing::debug!(device = %device, error = %e, "reading rejected");
                Err(e)
            }
        }
    }
}
