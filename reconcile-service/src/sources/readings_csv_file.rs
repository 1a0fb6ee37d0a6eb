use std::{fs::File, path::PathBuf};

use csv::StringRecord;
use network_client::domain::{DeviceKind, RawReading};
use time::OffsetDateTime;

use crate::pipeline::{Envelope, EnvelopeStream, PipelineError, Source};

/// Historical readings from a CSV file, replayed through the same pipeline as
/// live traffic.
///
/// Header columns, by name: `kind` (`flow`, `pressure` or `chlorine`),
/// `device_id`, `ts` (RFC3339) and `raw`. A malformed row is reported
/// downstream as an error and the file carries on.
pub struct ReadingsCsvFileSource {
    path: PathBuf,
}

impl ReadingsCsvFileSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

fn record_to_reading(record: &StringRecord, headers: &StringRecord) -> Result<RawReading, PipelineError> {
    let get = |name: &str| -> Result<&str, PipelineError> {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .and_then(|idx| record.get(idx))
            .map(str::trim)
            .ok_or_else(|| PipelineError::Source(format!("missing column '{name}' in CSV record")))
    };

    let kind_str = get("kind")?;
    let kind = DeviceKind::parse(kind_str)
        .ok_or_else(|| PipelineError::Source(format!("unknown device kind '{kind_str}'")))?;

    let ts_str = get("ts")?;
    let ts = OffsetDateTime::parse(ts_str, &time::format_description::well_known::Rfc3339)
        .map_err(|e| PipelineError::Source(format!("invalid ts '{ts_str}': {e}")))?;

    Ok(RawReading {
        kind,
        device_id: get("device_id")?.to_string(),
        ts,
        raw: get("raw")?.to_string(),
    })
}

#[async_trait::async_trait]
impl Source<RawReading> for ReadingsCsvFileSource {
    async fn stream(&self) -> Result<EnvelopeStream<RawReading>, PipelineError> {
        let file = File::open(&self.path).map_err(|e| {
            PipelineError::Source(format!("failed to open CSV file '{}': {e}", self.path.display()))
        })?;

        let s = async_stream::stream! {
            let mut rdr = csv::Reader::from_reader(file);
            let headers = match rdr.headers() {
                Ok(h) => h.clone(),
                Err(e) => {
                    yield Err(PipelineError::Source(format!("failed to read CSV headers: {e}")));
                    return;
                }
            };

            for (line, result) in rdr.records().enumerate() {
                let parsed = result
                    .map_err(|e| PipelineError::Source(format!("failed to read CSV record: {e}")))
                    .and_then(|record| record_to_reading(&record, &headers));
                match parsed {
                    Ok(reading) => yield Ok(Envelope::new(reading)),
                    Err(e) => {
                        metrics::counter!("readings_csv_parse_errors_total").increment(1);
                        tracing::warn!(line = line + 2, error = %e, "skipping CSV row");
                        yield Err(e);
                    }
                }
            }
        };

        Ok(Box::pin(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::io::Write;
    use time::macros::datetime;

    #[tokio::test]
    async fn bad_rows_do_not_end_the_stream() {
        let path = std::env::temp_dir().join(format!("readings-{}.csv", std::process::id()));
        {
            let mut f = File::create(&path).unwrap();
            writeln!(f, "kind,device_id,ts,raw").unwrap();
            writeln!(f, "flow,mtr-1,2020-03-05T17:15:00Z,360").unwrap();
            writeln!(f, "steam,mtr-1,2020-03-05T17:30:00Z,1").unwrap();
            writeln!(f, "pressure, pt-1 ,2020-03-05T17:30:00Z, 4.2").unwrap();
        }

        let items: Vec<_> = ReadingsCsvFileSource::new(&path).stream().await.unwrap().collect().await;
        std::fs::remove_file(&path).ok();

        assert_eq!(items.len(), 3);
        let first = items[0].as_ref().unwrap();
        assert_eq!(first.payload.kind, DeviceKind::Flow);
        assert_eq!(first.payload.ts, datetime!(2020-03-05 17:15:00 UTC));
        assert!(matches!(items[1], Err(PipelineError::Source(_))));
        let third = items[2].as_ref().unwrap();
        assert_eq!(third.payload.device_id, "pt-1");
        assert_eq!(third.payload.raw, "4.2");
    }

    #[tokio::test]
    async fn missing_file_fails_up_front() {
        let res = ReadingsCsvFileSource::new("/nonexistent/readings.csv").stream().await;
        assert!(matches!(res, Err(PipelineError::Source(_))));
    }
}
