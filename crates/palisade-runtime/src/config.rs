//! Worker group tags, acceptor configs, and configuration-time validation.

use std::collections::HashSet;
use std::net::SocketAddrV4;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::group::WorkerGroup;
use crate::io::Accepted;
use crate::worker::Worker;

/// Immutable per-group metadata plus the flag vector that shapes each
/// worker's tick loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerGroupTag {
    /// Group id; 0 is invalid, ids must be unique within a server.
    pub id: u16,
    pub name: String,
    pub workers_count: u16,
    /// Target loop frequency (Hz) for active groups.
    #[serde(default)]
    pub tick_rate: u16,
    /// Target frequency (Hz) of the TLS-sync slot; the loop runs at the
    /// larger of the two rates.
    #[serde(default)]
    pub sync_tls_tick_rate: u16,

    /// Proactive loop with a fixed tick rate. A reactive group instead
    /// blocks on its IO port with no fixed cadence.
    #[serde(default)]
    pub is_active: bool,
    /// The group owns an async IO port drained by its workers.
    #[serde(default)]
    pub enable_async_io: bool,
    /// Workers carry an AOD context and drain routed AOD inboxes.
    #[serde(default)]
    pub supports_aod: bool,
    /// Workers own a timer heap and receive routed delayed tasks.
    #[serde(default)]
    pub handles_timer_tasks: bool,
    /// Workers participate in the server-wide TLS-sync system.
    #[serde(default)]
    pub supports_tls_sync: bool,
    /// Additionally participate in a group-local TLS-sync system.
    #[serde(default)]
    pub has_group_specific_tls_sync: bool,
    /// Invoke the user tick handler each iteration.
    #[serde(default)]
    pub call_tick_handler: bool,
    /// Invoke every worker-service's tick each iteration.
    #[serde(default)]
    pub tick_worker_services: bool,
    /// Reserve thread-local capacity (heaps, buffers) at worker start.
    #[serde(default)]
    pub preallocate_thread_local_state: bool,
    /// Workers own a general-task MPSC inbox.
    #[serde(default)]
    pub enable_task_queue: bool,
    /// The group may own TCP acceptors.
    #[serde(default)]
    pub supports_tcp_async_acceptors: bool,
}

impl WorkerGroupTag {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let name = || self.name.clone();

        if self.id == 0 {
            return Err(ConfigError::ZeroGroupId(name()));
        }
        if self.workers_count == 0 {
            return Err(ConfigError::NoWorkers(name()));
        }
        if self.is_active && self.tick_rate == 0 {
            return Err(ConfigError::ZeroTickRate(name()));
        }
        if self.handles_timer_tasks && !self.is_active {
            return Err(ConfigError::TimerTasksRequireActive(name()));
        }
        if self.tick_worker_services && !self.is_active {
            return Err(ConfigError::ServiceTickRequiresActive(name()));
        }
        if self.supports_tcp_async_acceptors && !self.enable_async_io {
            return Err(ConfigError::AcceptorsRequireAsyncIo(name()));
        }
        if !self.is_active {
            if !self.enable_async_io {
                return Err(ConfigError::ReactiveRequiresAsyncIo(name()));
            }
            if self.enable_task_queue {
                return Err(ConfigError::ReactiveTaskQueue(name()));
            }
        }
        if self.enable_task_queue && self.enable_async_io {
            return Err(ConfigError::TaskQueueWithAsyncIo(name()));
        }

        Ok(())
    }

    /// Effective loop frequency, folding in the TLS-sync rate.
    pub(crate) fn effective_tick_rate(&self) -> u16 {
        if self.supports_tls_sync || self.has_group_specific_tls_sync {
            self.tick_rate.max(self.sync_tls_tick_rate)
        } else {
            self.tick_rate
        }
    }
}

pub type OnAccept = Arc<dyn Fn(Accepted) + Send + Sync>;
pub type WorkerHook = Arc<dyn Fn(&Worker, &WorkerGroup) + Send + Sync>;

/// One TCP acceptor owned by a group. `id` and `addr` must each be unique
/// within the group.
#[derive(Clone)]
pub struct TcpAcceptorConfig {
    pub id: u32,
    pub addr: SocketAddrV4,
    pub backlog: u32,
    pub on_accept: OnAccept,
}

impl std::fmt::Debug for TcpAcceptorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpAcceptorConfig")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("backlog", &self.backlog)
            .finish()
    }
}

/// Per-group configuration: the tag plus acceptors and user handlers.
#[derive(Default)]
pub struct WorkerGroupConfig {
    pub tag: WorkerGroupTag,
    pub acceptors: Vec<TcpAcceptorConfig>,
    pub on_worker_start: Option<WorkerHook>,
    pub on_worker_tick: Option<WorkerHook>,
    pub on_worker_stop: Option<WorkerHook>,
}

impl WorkerGroupConfig {
    pub fn new(tag: WorkerGroupTag) -> Self {
        WorkerGroupConfig {
            tag,
            acceptors: Vec::new(),
            on_worker_start: None,
            on_worker_tick: None,
            on_worker_stop: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tag.validate()?;

        let mut ids = HashSet::new();
        let mut addrs = HashSet::new();
        for acceptor in &self.acceptors {
            if !ids.insert(acceptor.id) {
                return Err(ConfigError::DuplicateAcceptorId(
                    self.tag.name.clone(),
                    acceptor.id,
                ));
            }
            if !addrs.insert(acceptor.addr) {
                return Err(ConfigError::DuplicateAcceptorAddr(
                    self.tag.name.clone(),
                    acceptor.addr,
                ));
            }
        }
        if !self.acceptors.is_empty() && !self.tag.supports_tcp_async_acceptors {
            return Err(ConfigError::AcceptorsRequireAsyncIo(self.tag.name.clone()));
        }

        Ok(())
    }
}

impl Default for WorkerGroupTag {
    fn default() -> Self {
        WorkerGroupTag {
            id: 0,
            name: String::new(),
            workers_count: 0,
            tick_rate: 0,
            sync_tls_tick_rate: 0,
            is_active: false,
            enable_async_io: false,
            supports_aod: false,
            handles_timer_tasks: false,
            supports_tls_sync: false,
            has_group_specific_tls_sync: false,
            call_tick_handler: false,
            tick_worker_services: false,
            preallocate_thread_local_state: false,
            enable_task_queue: false,
            supports_tcp_async_acceptors: false,
        }
    }
}

/// Whole-server configuration.
#[derive(Default)]
pub struct ServerConfig {
    pub name: String,
    pub groups: Vec<WorkerGroupConfig>,
    /// Run the last worker of the last group on the thread that calls
    /// `start`, making it the master worker.
    pub capture_calling_thread: bool,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        ServerConfig {
            name: name.into(),
            groups: Vec::new(),
            capture_calling_thread: false,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.groups.is_empty() {
            return Err(ConfigError::NoWorkerGroups(self.name.clone()));
        }

        let mut ids = HashSet::new();
        for group in &self.groups {
            group.validate()?;
            if !ids.insert(group.tag.id) {
                return Err(ConfigError::DuplicateGroupId(group.tag.id));
            }
        }

        Ok(())
    }
}

/// Flag aggregates derived from the group tags at server build time and
/// cached into every worker's TLS.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerFlags {
    pub all_groups_are_active: bool,
    pub supports_delayed_tasks: bool,
    pub all_groups_handle_timers: bool,
    pub all_groups_support_aod: bool,
}

impl ServerFlags {
    pub(crate) fn derive(groups: &[WorkerGroupConfig]) -> ServerFlags {
        ServerFlags {
            all_groups_are_active: groups.iter().all(|g| g.tag.is_active),
            supports_delayed_tasks: groups.iter().any(|g| g.tag.handles_timer_tasks),
            all_groups_handle_timers: groups.iter().all(|g| g.tag.handles_timer_tasks),
            all_groups_support_aod: groups
                .iter()
                .all(|g| g.tag.supports_aod && g.tag.is_active),
        }
    }
}
