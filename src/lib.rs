#![doc = include_str!("../README.md")]

pub mod clock;
pub mod envelope;
pub mod policy;
pub mod queue;
pub mod reachability;
pub mod transport;
mod worker;

#[doc(inline)]
pub use envelope::{Method, RequestEnvelope, LARGE_BODY_THRESHOLD};

#[doc(inline)]
pub use queue::{
    inmemory::InMemoryQueue, DurableQueue, ItemState, LastFailure, QueueError, QueueItem,
};

#[doc(inline)]
pub use policy::{FailureKind, RetryPolicy};

#[doc(inline)]
pub use transport::{
    InMemoryTransport, Transport, TransportError, TransportErrorKind, TransportResponse,
};

#[doc(inline)]
pub use reachability::{Reachability, StaticReachability, ToggleReachability};

#[doc(inline)]
pub use clock::{Clock, SystemClock, VirtualClock};

#[doc(inline)]
pub use worker::{
    DedupePolicy, DefaultWorkerHook, Worker, WorkerBuilder, WorkerConfig, WorkerHook,
};
