use async_trait::async_trait;
use reqwest::Client;

use crate::transport::{Transport, TransportError, TransportResponse};
use crate::{Method, RequestEnvelope};

/// reqwest-backed transport.
///
/// Performs exactly one HTTP request per send. Connection pooling, TLS and
/// timeouts are whatever the supplied [`Client`] is configured with; the
/// relay deliberately adds no timeout of its own.
#[derive(Clone, Default)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Create a transport with a default client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport over a preconfigured client.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[tracing::instrument(skip_all, fields(id = %envelope.id(), method = %envelope.method(), url = %envelope.url()))]
    async fn send(&self, envelope: &RequestEnvelope) -> Result<TransportResponse, TransportError> {
        let method = match envelope.method() {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
            Method::Head => reqwest::Method::HEAD,
        };

        let mut request = self.client.request(method, envelope.url());
        for (name, value) in envelope.headers() {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = envelope.body() {
            request = request.body(body.to_vec());
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::network(Box::new(e)))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::network(Box::new(e)))?
            .to_vec();

        tracing::debug!(status, "Response received");
        Ok(TransportResponse { status, headers, body })
    }
}
