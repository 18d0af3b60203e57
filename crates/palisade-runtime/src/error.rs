use std::net::SocketAddrV4;

use thiserror::Error;

/// Configuration-time validation failures. Surfaced before any worker
/// thread is created; the server must not continue.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("worker group '{0}' has id 0, ids start at 1")]
    ZeroGroupId(String),

    #[error("duplicate worker group id {0}")]
    DuplicateGroupId(u16),

    #[error("worker group '{0}' has no workers")]
    NoWorkers(String),

    #[error("worker group '{0}' is active but has a tick rate of 0")]
    ZeroTickRate(String),

    #[error("worker group '{0}': handling timer tasks requires an active group")]
    TimerTasksRequireActive(String),

    #[error("worker group '{0}': ticking worker services requires an active group")]
    ServiceTickRequiresActive(String),

    #[error("worker group '{0}': TCP acceptors require async IO")]
    AcceptorsRequireAsyncIo(String),

    #[error("worker group '{0}': a reactive group must enable async IO")]
    ReactiveRequiresAsyncIo(String),

    #[error("worker group '{0}': a reactive group must not also enable the task queue")]
    ReactiveTaskQueue(String),

    #[error("worker group '{0}': the task queue and async IO are mutually exclusive")]
    TaskQueueWithAsyncIo(String),

    #[error("worker group '{0}': acceptor id {1} used more than once")]
    DuplicateAcceptorId(String, u32),

    #[error("worker group '{0}': acceptor address {1} used more than once")]
    DuplicateAcceptorAddr(String, SocketAddrV4),

    #[error("server '{0}' has no worker groups")]
    NoWorkerGroups(String),
}

/// Runtime error taxonomy. Each variant maps to one failure kind of the
/// scheduler core; recoverable kinds (`Timeout`, `Cancelled`) are handled
/// locally by the tick loop and rarely escape to callers.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(#[from] ConfigError),

    #[error("failed to spawn worker thread for group '{group}'")]
    WorkerSpawn {
        group: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO system failure: {0}")]
    SystemIo(#[from] std::io::Error),

    #[error("operation cancelled by socket close")]
    Cancelled,

    #[error("timed out")]
    Timeout,

    #[error("an async receive is already pending on this socket")]
    ReceivePending,

    #[error("service {uid} failed to stop: {reason}")]
    ServiceStopFailure { uid: u32, reason: String },

    #[error("service {uid} failed to initialize: {reason}")]
    ServiceInitFailure { uid: u32, reason: String },

    #[error("the server is already running")]
    AlreadyRunning,

    #[error("the server is shutting down")]
    ShuttingDown,

    #[error("services cannot be registered while the server is running")]
    RegistryFrozen,
}
