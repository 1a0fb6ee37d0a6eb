use std::{net::SocketAddr, sync::Arc};

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use futures::StreamExt;
use network_client::domain::RawReading;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::pipeline::{Envelope, EnvelopeStream, PipelineError, Source};

#[derive(Clone)]
struct SharedSender {
    tx: mpsc::Sender<Envelope<RawReading>>,
}

/// Accepts batches of readings on `POST /ingest/readings`.
#[derive(Clone)]
pub struct HttpReadingsSource {
    receiver: Arc<tokio::sync::Mutex<Option<mpsc::Receiver<Envelope<RawReading>>>>>,
}

pub fn router(tx: mpsc::Sender<Envelope<RawReading>>) -> Router {
    Router::new()
        .route("/ingest/readings", post(ingest_readings))
        .with_state(SharedSender { tx })
}

impl HttpReadingsSource {
    pub async fn new(bind_addr: &str, channel_capacity: usize) -> Result<Self, PipelineError> {
        let (tx, rx) = mpsc::channel(channel_capacity);
        let app = router(tx);

        let addr: SocketAddr = bind_addr
            .parse()
            .map_err(|e| PipelineError::Source(format!("invalid bind addr: {e}")))?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| PipelineError::Source(format!("failed to bind {addr}: {e}")))?;
        tracing::info!(%addr, "readings endpoint listening");

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                tracing::error!(error = %e, "readings HTTP server error");
            }
        });

        Ok(Self {
            receiver: Arc::new(tokio::sync::Mutex::new(Some(rx))),
        })
    }
}

#[async_trait::async_trait]
impl Source<RawReading> for HttpReadingsSource {
    async fn stream(&self) -> Result<EnvelopeStream<RawReading>, PipelineError> {
        let rx = self
            .receiver
            .lock()
            .await
            .take()
            .ok_or_else(|| PipelineError::Source("readings stream already taken".to_string()))?;

        Ok(Box::pin(ReceiverStream::new(rx).map(Ok)))
    }
}

async fn ingest_readings(
    State(sender): State<SharedSender>,
    Json(payload): Json<Vec<RawReading>>,
) -> Result<StatusCode, StatusCode> {
    metrics::counter!("http_ingest_requests_total").increment(1);

    for reading in payload {
        if sender.tx.send(Envelope::new(reading)).await.is_err() {
            metrics::counter!("http_ingest_failed_total").increment(1);
            return Err(StatusCode::SERVICE_UNAVAILABLE);
        }
    }

    Ok(StatusCode::ACCEPTED)
}
