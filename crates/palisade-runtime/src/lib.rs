//! Worker-group runtime foundation for authoritative game servers.
//!
//! The runtime multiplexes async socket IO, timer-driven work, and
//! object-affinity dispatch over a fixed pool of OS threads. Applications
//! compose *worker groups* (thread pools shaped by a flag tag), register
//! *services* (lifecycle-managed components), and enqueue work as *tasks*:
//! free-floating, bound to an object (serialized per object, see
//! [`aod`]), or timer-delayed.
//!
//! # Operating model
//!
//! - One OS thread per worker, no work stealing. Each worker runs a tick
//!   loop whose steps are selected by its group's immutable tag.
//! - Cross-thread hand-off goes through intrusive lock-free MPSC inboxes;
//!   the owning worker is always the only consumer.
//! - Async IO is completion-shaped: requests carry their buffer and
//!   handler into the group's [`io::CompletionPort`]; whichever worker
//!   dequeues the completion runs the handler.
//! - Delayed work produced on a thread whose group cannot host it is
//!   round-robin routed to a capable group's worker.

pub mod aod;
pub mod clock;
pub mod config;
mod context;
pub mod error;
pub mod group;
pub mod io;
pub mod metrics;
mod router;
pub mod server;
pub mod service;
pub mod task;
mod timer;
pub mod tls_sync;
pub mod tuning;
pub mod worker;

pub use aod::{CustomObject, CustomRef, SharedObject, StaticObject};
pub use clock::{Ticks, due_after, precise_sleep, uptime_millis};
pub use config::{
    OnAccept, ServerConfig, ServerFlags, TcpAcceptorConfig, WorkerGroupConfig, WorkerGroupTag,
    WorkerHook,
};
pub use error::{ConfigError, RuntimeError};
pub use group::WorkerGroup;
pub use io::{Accepted, CompletionPort, IoBuffer, IoResult, IoStatus, SocketId, TcpAcceptor};
pub use metrics::WorkerMetrics;
pub use server::{ServerExit, ServerInstance};
pub use service::{
    ActiveService, AodService, Service, SimpleService, StopSignalResult, WorkerService,
};
pub use task::{TaskCtx, TaskRef, defer_task, defer_task_after, make_task};
pub use tls_sync::TlsSyncSystem;
pub use worker::Worker;
