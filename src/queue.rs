//! Durable queue contract and scheduling records.
//!
//! This module defines the storage side of the relay: the mutable
//! [`QueueItem`] scheduling record and the [`DurableQueue`] contract any
//! backend must honor.
//!
//! The queue is responsible for **durability and ordering**, while dispatch
//! concerns are delegated to the worker and transport layers.
//!
//! ## Responsibilities
//!
//! - Persist queue items atomically, one write at a time
//! - Serve ready items in deterministic scheduling order
//! - Keep failed items around for caller inspection
//!
//! ## Components
//!
//! - [`QueueItem`]: scheduling record wrapping a [`RequestEnvelope`]
//! - [`DurableQueue`]: the contract implemented by storage backends
//! - [`InMemoryQueue`](inmemory::InMemoryQueue): mutex-guarded reference
//!   backend
//! - `SqlxQueue` (feature `sqlx`): SQLite-backed implementation
//!
//! The queue exclusively owns the authoritative copy of each item; the
//! worker holds only working copies during a dispatch cycle and writes them
//! back before the record counts as updated.

pub mod inmemory;

#[cfg(feature = "sqlx")]
pub mod sqlx;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing_error::SpanTrace;

use crate::{FailureKind, RequestEnvelope};

/// Error returned by queue operations.
///
/// Wraps the underlying backend error and captures a tracing span backtrace
/// for improved diagnostics.
#[derive(Debug)]
pub struct QueueError {
    context: SpanTrace,
    source: tower::BoxError,
}

impl QueueError {
    /// Create a backend-related queue error.
    pub fn backend(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self {
            context: SpanTrace::capture(),
            source: err,
        }
    }
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Backend error: {}", self.source)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for QueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Scheduling state of a [`QueueItem`].
///
/// `Failed`, `Succeeded` and `Canceled` are terminal; no automatic
/// transition leaves them. No internal operation currently produces
/// `Canceled`; it is reserved for external cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Pending,
    InFlight,
    Delayed,
    Failed,
    Succeeded,
    Canceled,
}

impl ItemState {
    /// States eligible for [`DurableQueue::load_ready`].
    pub fn is_ready_candidate(&self) -> bool {
        matches!(self, ItemState::Pending | ItemState::Delayed)
    }

    /// States counted by [`DurableQueue::count_active`].
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ItemState::Pending | ItemState::InFlight | ItemState::Delayed
        )
    }
}

/// Metadata about the most recent failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastFailure {
    /// Classification of the failure.
    pub kind: FailureKind,
    /// Free-form detail, e.g. the response status line or transport error.
    pub detail: String,
}

/// Mutable scheduling record wrapping a [`RequestEnvelope`].
///
/// Created in state `Pending` when an envelope is enqueued; mutated
/// exclusively by the worker as it dispatches, succeeds or fails items;
/// removed from the store on success; left in terminal `Failed` state when
/// retries are exhausted (no automatic purge).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Identifier, equal to the envelope identifier.
    pub id: String,
    /// The request being relayed.
    pub envelope: RequestEnvelope,
    /// Priority copied from the (already normalized) envelope priority.
    pub priority: i32,
    /// Current scheduling state.
    pub state: ItemState,
    /// Delivery attempts made so far.
    pub attempts: u32,
    /// Earliest time the item may be dispatched.
    pub next_eligible: DateTime<Utc>,
    /// Most recent failure, if any.
    pub last_failure: Option<LastFailure>,
}

impl QueueItem {
    /// Create a fresh pending item for an envelope, eligible at `now`.
    pub fn pending(envelope: RequestEnvelope, now: DateTime<Utc>) -> Self {
        Self {
            id: envelope.id().to_string(),
            priority: envelope.priority(),
            envelope,
            state: ItemState::Pending,
            attempts: 0,
            next_eligible: now,
            last_failure: None,
        }
    }

    /// Creation timestamp, taken from the envelope.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.envelope.created_at()
    }

    /// Readiness check used by [`DurableQueue::load_ready`] implementations.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.state.is_ready_candidate() && self.next_eligible <= now
    }
}

/// Ordered, crash-tolerant storage of [`QueueItem`]s.
///
/// All operations must be safe under concurrent callers (a writer enqueuing
/// while the drain loop reads and writes). Each write must be atomic with
/// respect to reads of the same record; a durable backend must make each
/// operation transactional so a crash mid-write never leaves a record
/// half-updated.
#[async_trait]
pub trait DurableQueue: Send + Sync {
    /// Insert or replace an item by identifier.
    async fn save(&self, item: QueueItem) -> Result<(), QueueError>;

    /// Semantically identical to [`save`](DurableQueue::save); present for
    /// clarity at call sites that rewrite an existing record.
    async fn update(&self, item: QueueItem) -> Result<(), QueueError> {
        self.save(item).await
    }

    /// Remove an item by identifier; no-op if absent.
    async fn delete(&self, id: &str) -> Result<(), QueueError>;

    /// Items with state ∈ {pending, delayed} and `next_eligible <= now`,
    /// ordered by priority descending, next-eligible ascending, creation
    /// time ascending, then identifier ascending, truncated to `limit`.
    async fn load_ready(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>, QueueError>;

    /// All items whose envelope carries this dedupe key, in creation order.
    async fn load_by_dedupe_key(&self, key: &str) -> Result<Vec<QueueItem>, QueueError>;

    /// All items, ordered by creation time then identifier.
    async fn load_all(&self) -> Result<Vec<QueueItem>, QueueError>;

    /// Count of items in state ∈ {pending, in-flight, delayed}.
    async fn count_active(&self) -> Result<usize, QueueError>;
}

/// Scheduling order shared by every backend: priority descending, then
/// next-eligible, creation time and identifier ascending.
pub(crate) fn scheduling_order(a: &QueueItem, b: &QueueItem) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.next_eligible.cmp(&b.next_eligible))
        .then_with(|| a.created_at().cmp(&b.created_at()))
        .then_with(|| a.id.cmp(&b.id))
}
