//! Injectable time source.
//!
//! Backoff math and wake timers are only testable when time is
//! substitutable, so the worker never reads the system clock directly: it
//! goes through [`Clock`]. Production uses [`SystemClock`]; tests use
//! [`VirtualClock`] and advance it explicitly.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

/// Time source consumed by the worker.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;

    /// Suspend the caller for the given interval.
    async fn sleep(&self, duration: Duration);
}

/// Clock backed by the operating system and the tokio timer.
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Manually advanced clock for deterministic tests.
///
/// `sleep` suspends until [`advance`](VirtualClock::advance) has moved the
/// current time past the requested deadline; real time never passes on its
/// own.
#[derive(Clone)]
pub struct VirtualClock {
    inner: std::sync::Arc<Inner>,
}

struct Inner {
    now: std::sync::Mutex<DateTime<Utc>>,
    tick: Notify,
}

impl VirtualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: std::sync::Arc::new(Inner {
                now: std::sync::Mutex::new(start),
                tick: Notify::new(),
            }),
        }
    }

    /// Move the clock forward and wake every pending sleeper whose deadline
    /// has passed.
    pub fn advance(&self, duration: Duration) {
        {
            let mut now = self.lock_now();
            *now = now
                .checked_add_signed(chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
        }
        self.inner.tick.notify_waiters();
    }

    fn lock_now(&self) -> std::sync::MutexGuard<'_, DateTime<Utc>> {
        // A poisoned lock only means a panicking test; the value is still valid.
        self.inner.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

#[async_trait]
impl Clock for VirtualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.lock_now()
    }

    async fn sleep(&self, duration: Duration) {
        let deadline = self
            .now()
            .checked_add_signed(chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        loop {
            // Register before re-checking so an advance between the check and
            // the await cannot be missed.
            let tick = self.inner.tick.notified();
            if self.now() >= deadline {
                return;
            }
            tick.await;
        }
    }
}
