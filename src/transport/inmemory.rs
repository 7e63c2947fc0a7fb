use std::{collections::VecDeque, sync::Arc};

use tokio::sync::Mutex;

use crate::transport::{Transport, TransportError, TransportResponse};
use crate::RequestEnvelope;

/// In-memory transport for testing or local pipelines.
///
/// Sends are answered from a scripted queue of outcomes; once the script is
/// exhausted every send succeeds with a `200`. Every dispatched envelope is
/// recorded and can be inspected afterwards. Useful for:
/// - Unit and integration testing
/// - Simulating flaky delivery without a real server
/// - Debugging relay flows
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    script: Arc<Mutex<VecDeque<Outcome>>>,
    sent: Arc<Mutex<Vec<RequestEnvelope>>>,
}

enum Outcome {
    Respond(TransportResponse),
    NetworkError(String),
}

impl InMemoryTransport {
    /// Create a transport that answers every send with `200`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next unanswered send to return this response.
    pub async fn push_response(&self, response: TransportResponse) {
        self.script.lock().await.push_back(Outcome::Respond(response));
    }

    /// Script the next unanswered send to return this status with no
    /// headers or body.
    pub async fn push_status(&self, status: u16) {
        self.push_response(TransportResponse::with_status(status)).await;
    }

    /// Script the next unanswered send to fail at the network level.
    pub async fn push_network_error(&self, detail: impl Into<String>) {
        self.script
            .lock()
            .await
            .push_back(Outcome::NetworkError(detail.into()));
    }

    /// Envelopes sent so far, in dispatch order.
    pub async fn sent_envelopes(&self) -> Vec<RequestEnvelope> {
        self.sent.lock().await.clone()
    }

    /// Number of sends attempted so far.
    pub async fn send_count(&self) -> usize {
        self.sent.lock().await.len()
    }
}

#[async_trait::async_trait]
impl Transport for InMemoryTransport {
    /// "Send" an envelope by recording it and replaying the script.
    #[tracing::instrument(skip_all, fields(id = %envelope.id()))]
    async fn send(&self, envelope: &RequestEnvelope) -> Result<TransportResponse, TransportError> {
        self.sent.lock().await.push(envelope.clone());

        let outcome = self.script.lock().await.pop_front();
        match outcome {
            Some(Outcome::Respond(response)) => {
                tracing::info!(status = response.status, "Scripted response");
                Ok(response)
            }
            Some(Outcome::NetworkError(detail)) => {
                tracing::info!(%detail, "Scripted network error");
                Err(TransportError::network(detail.into()))
            }
            None => Ok(TransportResponse::with_status(200)),
        }
    }
}
