use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Body size above which an envelope is always dispatched first.
pub const LARGE_BODY_THRESHOLD: usize = 1024 * 1024;

/// HTTP method carried by a [`RequestEnvelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl Method {
    /// Uppercase wire representation of the method.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable description of one outbound request.
///
/// `RequestEnvelope` bundles the request itself (target, method, headers,
/// body) with the scheduling hints the relay needs: a priority and an
/// optional dedupe key.
///
/// ## Construction
///
/// Envelopes are built with [`RequestEnvelope::new`] followed by the
/// `with_*` methods. The identifier and creation timestamp are generated
/// once, at construction, and never change.
///
/// ## Priority normalization
///
/// Bodies larger than 1 MiB force the priority to `i32::MAX`, overriding any
/// caller-supplied value, so large uploads always sort first. The invariant
/// is maintained by every builder step; a finished envelope always satisfies
/// it.
///
/// ## Example
///
/// ```rust
/// use backhaul::{Method, RequestEnvelope};
///
/// let envelope = RequestEnvelope::new(Method::Post, "https://api.example.com/events")
///     .with_header("content-type", "application/json")
///     .with_body(b"{}".to_vec())
///     .with_priority(3)
///     .with_dedupe_key("event-42");
///
/// assert_eq!(envelope.priority(), 3);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    id: String,
    url: String,
    method: Method,
    headers: HashMap<String, String>,
    body: Option<Vec<u8>>,
    priority: i32,
    created_at: DateTime<Utc>,
    dedupe_key: Option<String>,
}

impl RequestEnvelope {
    /// Create a new envelope with a fresh identifier and creation timestamp.
    ///
    /// Defaults: no headers, no body, priority 0, no dedupe key.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            url: url.into(),
            method,
            headers: HashMap::new(),
            body: None,
            priority: 0,
            created_at: Utc::now(),
            dedupe_key: None,
        }
    }

    /// Add a request header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set the request body.
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self.normalize()
    }

    /// Set the scheduling priority (higher sorts earlier).
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self.normalize()
    }

    /// Set the dedupe key used for duplicate suppression on enqueue.
    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    /// Large bodies always win the priority ordering.
    fn normalize(mut self) -> Self {
        if self.body.as_ref().is_some_and(|b| b.len() > LARGE_BODY_THRESHOLD) {
            self.priority = i32::MAX;
        }
        self
    }

    /// Globally unique envelope identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Target address.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// HTTP method.
    pub fn method(&self) -> Method {
        self.method
    }

    /// Request headers.
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Request body, if any.
    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    /// Normalized scheduling priority.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Creation timestamp.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Dedupe key, if any.
    pub fn dedupe_key(&self) -> Option<&str> {
        self.dedupe_key.as_deref()
    }
}
