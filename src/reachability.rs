//! Connectivity monitoring interface.
//!
//! The worker only needs two things from a connectivity monitor: a
//! point-in-time answer and a stream of transitions so it can be kicked when
//! the network comes back. Both are derived from a `tokio::sync::watch`
//! channel, which gives last-value-wins buffering for free: only the
//! boolean matters, so dropping intermediate duplicates is acceptable.
//!
//! Platform-specific monitors (OS connectivity callbacks, interface
//! watchers) bridge into this interface by publishing into the watch sender.

use futures_core::stream::BoxStream;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

/// Source of connectivity state consumed by the worker.
pub trait Reachability: Send + Sync {
    /// Point-in-time connectivity.
    fn is_reachable(&self) -> bool;

    /// Watch channel carrying the current connectivity value.
    fn watch(&self) -> watch::Receiver<bool>;

    /// Stream of connectivity values, starting with the current one.
    ///
    /// Every transition to online is delivered; intermediate duplicates may
    /// be collapsed.
    fn changes(&self) -> BoxStream<'static, bool> {
        Box::pin(WatchStream::new(self.watch()))
    }
}

/// Reachability backed by a watch channel that tests (or platform adapters)
/// can toggle.
pub struct ToggleReachability {
    tx: watch::Sender<bool>,
}

impl ToggleReachability {
    /// Create with an initial connectivity value.
    pub fn new(reachable: bool) -> Self {
        let (tx, _) = watch::channel(reachable);
        Self { tx }
    }

    /// Publish a new connectivity value.
    pub fn set(&self, reachable: bool) {
        // send_replace never fails; the sender keeps its own receiver alive.
        self.tx.send_replace(reachable);
    }
}

impl Reachability for ToggleReachability {
    fn is_reachable(&self) -> bool {
        *self.tx.borrow()
    }

    fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Reachability that never changes. Useful for always-online deployments
/// and tests that do not exercise connectivity transitions.
pub struct StaticReachability {
    inner: ToggleReachability,
}

impl StaticReachability {
    /// Create with a fixed connectivity value.
    pub fn new(reachable: bool) -> Self {
        Self {
            inner: ToggleReachability::new(reachable),
        }
    }
}

impl Reachability for StaticReachability {
    fn is_reachable(&self) -> bool {
        self.inner.is_reachable()
    }

    fn watch(&self) -> watch::Receiver<bool> {
        self.inner.watch()
    }
}
