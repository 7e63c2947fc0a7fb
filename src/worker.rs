//! Worker loop for relaying queued requests through a transport.
//!
//! This module implements the drain-loop engine that:
//!
//! - Accepts envelopes via [`enqueue`](Worker::enqueue), applying the
//!   configured dedupe policy
//! - Pulls ready batches from the [`DurableQueue`] while reachable
//! - Dispatches each item through the [`Transport`]
//! - Classifies failures and re-persists items per the [`RetryPolicy`]
//! - Arms a wake timer for the soonest delayed item before going idle
//! - Exposes lifecycle hooks for observability and customization
//!
//! At most one drain loop is active at a time: [`kick`](Worker::kick) is
//! idempotent and a no-op while a loop is already running. The loop exits
//! when the store has no ready items or reachability is lost, and is
//! re-entered by a future enqueue, a regained-connectivity event, or an
//! armed wake timer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;

use crate::queue::{DurableQueue, ItemState, LastFailure, QueueError, QueueItem};
use crate::transport::TransportErrorKind;
use crate::{Clock, FailureKind, Reachability, RequestEnvelope, RetryPolicy, Transport};

/// How enqueue treats an envelope whose dedupe key is already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DedupePolicy {
    /// Persist every envelope regardless of key.
    #[default]
    KeepAll,
    /// Discard the new envelope when any item shares its key.
    DropNewIfExists,
    /// Delete existing items sharing the key, then persist the new one.
    KeepNewest,
}

/// Configuration surface consumed by the worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Retry, backoff and classification policy.
    pub policy: RetryPolicy,
    /// Maximum items pulled per drain iteration (at least 1).
    pub batch_size: usize,
    /// Duplicate suppression on enqueue.
    pub dedupe: DedupePolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::default(),
            batch_size: 10,
            dedupe: DedupePolicy::default(),
        }
    }
}

/// Builder for creating a [`Worker`].
///
/// Collaborators are injected here; [`start`](WorkerBuilder::start) spawns
/// the reachability watcher and returns the running worker handle.
pub struct WorkerBuilder {
    store: Arc<dyn DurableQueue>,
    transport: Arc<dyn Transport>,
    reachability: Arc<dyn Reachability>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
    hook: Box<dyn WorkerHook>,
}

impl WorkerBuilder {
    /// Create a builder over the injected collaborators, with the default
    /// configuration and hook.
    pub fn new(
        store: Arc<dyn DurableQueue>,
        transport: Arc<dyn Transport>,
        reachability: Arc<dyn Reachability>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            transport,
            reachability,
            clock,
            config: WorkerConfig::default(),
            hook: Box::new(DefaultWorkerHook),
        }
    }

    /// Replace the worker configuration.
    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the lifecycle hook.
    ///
    /// This allows customizing behavior (logging, metrics, UI refresh, etc.)
    /// without touching the engine.
    pub fn with_hook(mut self, hook: impl WorkerHook + 'static) -> Self {
        self.hook = Box::new(hook);
        self
    }

    /// Start the worker.
    ///
    /// Spawns a watcher that kicks the drain loop on every transition to
    /// online. The watcher also observes the current value once at startup,
    /// so a worker started online immediately drains whatever a previous
    /// run left in the store.
    pub fn start(mut self) -> Worker {
        self.config.batch_size = self.config.batch_size.max(1);

        let inner = Arc::new(WorkerInner {
            store: self.store,
            transport: self.transport,
            reachability: self.reachability,
            clock: self.clock,
            config: self.config,
            hook: self.hook,
            enqueue_gate: tokio::sync::Mutex::new(()),
            running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            wake: tokio::sync::Mutex::new(None),
        });

        let watcher = inner.clone();
        tokio::spawn(async move {
            let mut changes = watcher.reachability.changes();
            let mut last = false;
            loop {
                tokio::select! {
                    _ = watcher.shutdown.cancelled() => break,
                    value = changes.next() => match value {
                        Some(reachable) => {
                            if reachable && !last {
                                tracing::debug!("Connectivity regained");
                                watcher.kick();
                            }
                            last = reachable;
                        }
                        None => break,
                    }
                }
            }
        });

        Worker { inner }
    }
}

/// Handle to the drain-loop engine.
///
/// Cloning is cheap; all clones drive the same engine. Callers communicate
/// with the worker only through [`enqueue`](Worker::enqueue),
/// [`kick`](Worker::kick) and [`stop`](Worker::stop); the engine's internal
/// state is never reachable from outside.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    /// Accept an envelope for relay.
    ///
    /// Applies the dedupe policy, persists a pending [`QueueItem`] and kicks
    /// the drain loop, unless the policy short-circuits dispatch while
    /// offline, in which case the item just waits in the store.
    ///
    /// A duplicate dropped by [`DedupePolicy::DropNewIfExists`] is not an
    /// error; it is reported through the hook and discarded.
    pub async fn enqueue(&self, envelope: RequestEnvelope) -> Result<(), QueueError> {
        self.inner.enqueue(envelope).await
    }

    /// Start the drain loop if it is not already running.
    ///
    /// Idempotent: while a loop is active, further kicks are no-ops.
    pub fn kick(&self) {
        self.inner.kick();
    }

    /// Stop the worker.
    ///
    /// Cancels the armed wake timer and the reachability watcher and
    /// prevents any new loop iteration from starting. A batch currently
    /// mid-dispatch runs to completion; in-flight sends are not interrupted.
    pub fn stop(&self) {
        self.inner.shutdown.cancel();
        self.inner.hook.on_shutdown();
    }
}

struct WorkerInner {
    store: Arc<dyn DurableQueue>,
    transport: Arc<dyn Transport>,
    reachability: Arc<dyn Reachability>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
    hook: Box<dyn WorkerHook>,
    /// Serializes enqueue's dedupe check with its save; without this two
    /// concurrent enqueues sharing a key can both observe no existing item.
    enqueue_gate: tokio::sync::Mutex<()>,
    /// Single-flight guard for the drain loop.
    running: AtomicBool,
    shutdown: CancellationToken,
    /// Cancellation for the currently armed wake timer, if any.
    wake: tokio::sync::Mutex<Option<CancellationToken>>,
}

impl WorkerInner {
    #[tracing::instrument(skip_all, fields(id = %envelope.id()))]
    async fn enqueue(self: &Arc<Self>, envelope: RequestEnvelope) -> Result<(), QueueError> {
        let _gate = self.enqueue_gate.lock().await;
        if let Some(key) = envelope.dedupe_key() {
            match self.config.dedupe {
                DedupePolicy::KeepAll => {}
                DedupePolicy::DropNewIfExists => {
                    if !self.store.load_by_dedupe_key(key).await?.is_empty() {
                        self.hook.on_duplicate_dropped(&envelope);
                        return Ok(());
                    }
                }
                DedupePolicy::KeepNewest => {
                    for stale in self.store.load_by_dedupe_key(key).await? {
                        self.store.delete(&stale.id).await?;
                    }
                }
            }
        }

        let item = QueueItem::pending(envelope, self.clock.now());
        self.store.save(item.clone()).await?;
        self.hook.on_enqueued(&item);

        if self.config.policy.skip_dispatch_offline && !self.reachability.is_reachable() {
            return Ok(());
        }
        self.kick();
        Ok(())
    }

    fn kick(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::trace!("Drain loop already running");
            return;
        }

        let inner = self.clone();
        tokio::spawn(async move {
            loop {
                inner.drain_loop().await;
                inner.running.store(false, Ordering::Release);

                // An enqueue that landed while the loop was exiting saw the
                // running flag still set and dropped its kick; retake the
                // flag if ready work appeared in that window.
                if inner.shutdown.is_cancelled() || !inner.reachability.is_reachable() {
                    break;
                }
                match inner.store.load_ready(1, inner.clock.now()).await {
                    Ok(batch) if !batch.is_empty() => {
                        if inner
                            .running
                            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                            .is_err()
                        {
                            break;
                        }
                    }
                    _ => break,
                }
            }
        });
    }

    /// One drain run: consume ready batches while reachable, then arm a wake
    /// timer for the soonest delayed item or exit idle.
    #[tracing::instrument(skip_all)]
    async fn drain_loop(self: &Arc<Self>) {
        while self.reachability.is_reachable() && !self.shutdown.is_cancelled() {
            let now = self.clock.now();
            let batch = match self.store.load_ready(self.config.batch_size, now).await {
                Ok(batch) => batch,
                Err(err) => {
                    self.hook.on_storage_error(&err);
                    return;
                }
            };

            if batch.is_empty() {
                self.arm_wake_timer().await;
                return;
            }

            for item in batch {
                self.dispatch(item).await;
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, mut item: QueueItem) {
        item.state = ItemState::InFlight;
        self.hook.on_dispatch(&item);
        if let Err(err) = self.store.update(item.clone()).await {
            // The in-flight marker is bookkeeping; the send still happens.
            self.hook.on_storage_error(&err);
        }

        let failure = match self.transport.send(&item.envelope).await {
            Err(err) => {
                let detail = match err.kind() {
                    TransportErrorKind::Network(cause) => cause.to_string(),
                };
                (FailureKind::Network, detail)
            }
            Ok(response) => {
                match self
                    .config
                    .policy
                    .classify(response.status, &response.headers)
                {
                    None => {
                        item.state = ItemState::Succeeded;
                        if let Err(err) = self.store.update(item.clone()).await {
                            self.hook.on_storage_error(&err);
                        }
                        if let Err(err) = self.store.delete(&item.id).await {
                            self.hook.on_storage_error(&err);
                        }
                        self.hook.on_delivered(&item);
                        return;
                    }
                    Some(kind) => (kind, format!("HTTP {}", response.status)),
                }
            }
        };

        self.settle_failure(item, failure.0, failure.1).await;
    }

    /// Apply the retry decision for a classified failure.
    async fn settle_failure(self: &Arc<Self>, mut item: QueueItem, kind: FailureKind, detail: String) {
        item.attempts += 1;
        item.last_failure = Some(LastFailure {
            kind: kind.clone(),
            detail,
        });

        let delay = match &kind {
            FailureKind::ClientTerminal => None,
            // An explicit server-provided delay is honored regardless of the
            // attempt count.
            FailureKind::RateLimited(Some(delay)) => Some(*delay),
            _ if item.attempts < self.config.policy.max_attempts => {
                Some(self.config.policy.backoff(item.attempts))
            }
            _ => None,
        };

        match delay {
            Some(delay) => {
                item.state = ItemState::Delayed;
                // A server-provided delay can exceed what a timestamp can
                // carry; saturate instead of overflowing.
                item.next_eligible = self
                    .clock
                    .now()
                    .checked_add_signed(to_chrono(delay))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                self.hook.on_retry_scheduled(&item, delay);
            }
            None => {
                item.state = ItemState::Failed;
                self.hook.on_failed(&item);
            }
        }

        if let Err(err) = self.store.update(item).await {
            self.hook.on_storage_error(&err);
        }
    }

    /// Find the soonest delayed item and schedule a kick for it; with no
    /// delayed items the worker simply goes idle.
    async fn arm_wake_timer(self: &Arc<Self>) {
        let soonest = match self.store.load_all().await {
            Ok(items) => items
                .into_iter()
                .filter(|item| item.state == ItemState::Delayed)
                .map(|item| item.next_eligible)
                .min(),
            Err(err) => {
                self.hook.on_storage_error(&err);
                None
            }
        };

        let Some(at) = soonest else {
            self.hook.on_idle();
            return;
        };

        let delay = (at - self.clock.now()).to_std().unwrap_or(Duration::ZERO);
        let token = self.shutdown.child_token();
        {
            let mut slot = self.wake.lock().await;
            if let Some(previous) = slot.replace(token.clone()) {
                previous.cancel();
            }
        }
        self.hook.on_wake_armed(at, delay);

        let inner = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = inner.clock.sleep(delay) => inner.kick(),
            }
        });
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Hook trait for observing worker lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
/// Typical use cases include logging, metrics, and refreshing a UI that
/// lists queued requests.
pub trait WorkerHook: Send + Sync {
    fn on_enqueued(&self, item: &QueueItem);
    fn on_duplicate_dropped(&self, envelope: &RequestEnvelope);
    fn on_dispatch(&self, item: &QueueItem);
    fn on_delivered(&self, item: &QueueItem);
    fn on_retry_scheduled(&self, item: &QueueItem, delay: Duration);
    fn on_failed(&self, item: &QueueItem);
    fn on_storage_error(&self, error: &dyn std::error::Error);
    fn on_wake_armed(&self, at: DateTime<Utc>, delay: Duration);
    fn on_idle(&self);
    fn on_shutdown(&self);
}

/// Default worker hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultWorkerHook;

impl WorkerHook for DefaultWorkerHook {
    fn on_enqueued(&self, item: &QueueItem) {
        tracing::debug!(id = %item.id, priority = item.priority, "Item enqueued");
    }

    fn on_duplicate_dropped(&self, envelope: &RequestEnvelope) {
        tracing::info!(id = %envelope.id(), key = ?envelope.dedupe_key(), "Duplicate envelope dropped");
    }

    fn on_dispatch(&self, item: &QueueItem) {
        tracing::debug!(id = %item.id, attempt = item.attempts + 1, "Dispatching item");
    }

    fn on_delivered(&self, item: &QueueItem) {
        tracing::info!(id = %item.id, "Item delivered successfully");
    }

    fn on_retry_scheduled(&self, item: &QueueItem, delay: Duration) {
        tracing::info!(
            id = %item.id,
            attempts = item.attempts,
            ?delay,
            "Retry scheduled"
        );
    }

    fn on_failed(&self, item: &QueueItem) {
        tracing::warn!(id = %item.id, attempts = item.attempts, "Item failed terminally");
    }

    fn on_storage_error(&self, error: &dyn std::error::Error) {
        tracing::error!(?error, "Storage error during drain");
    }

    fn on_wake_armed(&self, at: DateTime<Utc>, delay: Duration) {
        tracing::debug!(%at, ?delay, "Wake timer armed");
    }

    fn on_idle(&self) {
        tracing::debug!("Queue drained, going idle");
    }

    fn on_shutdown(&self) {
        tracing::info!("Worker is shutting down");
    }
}
