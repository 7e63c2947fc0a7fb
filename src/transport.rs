//! Transport abstraction and sender backends.
//!
//! This module defines the narrow interface the worker uses to put a
//! [`RequestEnvelope`] on the wire, plus concrete backends: an in-memory
//! scripted transport for tests and local pipelines, and a feature-gated
//! reqwest backend.
//!
//! A transport performs exactly one send per call. It carries no retry
//! behavior of its own and no timeout policy beyond what the underlying
//! client enforces; retry and scheduling live entirely in the worker.
//!
//! ## Key components
//!
//! - [`Transport`]: trait implemented by concrete sender backends
//! - [`TransportResponse`]: status, headers and body of an HTTP response
//! - [`TransportError`]: unified error type with tracing context

pub mod inmemory;

#[cfg(feature = "http")]
pub mod http;

use std::collections::HashMap;

use async_trait::async_trait;
use tracing_error::SpanTrace;

use crate::RequestEnvelope;

pub use inmemory::InMemoryTransport;

/// Response produced by a [`Transport`] send.
///
/// Receiving a response of any status is a transport-level success; turning
/// the status code into a failure classification is the retry policy's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: HashMap<String, String>,
    /// Response body.
    pub body: Vec<u8>,
}

impl TransportResponse {
    /// A bare response with the given status and no headers or body.
    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }
}

/// Trait implemented by concrete sender backends.
///
/// A transport delivers a [`RequestEnvelope`] to its target and returns the
/// response, or fails with a network-level error when no response was
/// received.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send an envelope and return the response.
    async fn send(&self, envelope: &RequestEnvelope) -> Result<TransportResponse, TransportError>;
}

/// Error returned by transport operations.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct TransportError {
    context: SpanTrace,
    kind: TransportErrorKind,
}

/// Transport error kinds.
#[derive(Debug)]
pub enum TransportErrorKind {
    /// No response was received from the network.
    Network(tower::BoxError),
}

impl TransportError {
    /// Create a network-level transport error.
    pub fn network(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Network(err),
        }
    }

    /// The error kind.
    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TransportErrorKind::Network(err) => writeln!(f, "Network error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TransportErrorKind::Network(err) => Some(err.as_ref()),
        }
    }
}
