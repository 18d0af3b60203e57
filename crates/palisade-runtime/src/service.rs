//! Lifecycle-managed server components.
//!
//! Four kinds, all registered before the server starts and identified by a
//! 1-based uid in registration order within their kind:
//!
//! - [`SimpleService`] — lifecycle hooks only.
//! - [`AodService`] — same hooks; by convention all of its work funnels
//!   through a dispatch object the service owns (see [`crate::aod`]), so
//!   callers never need to lock it.
//! - [`ActiveService`] — additionally ticked from the server's
//!   self-re-arming service tick task.
//! - [`WorkerService`] — additionally hooked into every worker's start,
//!   stop, and (on groups that tick services) loop iteration.

use std::sync::Arc;

use crate::error::RuntimeError;
use crate::group::WorkerGroup;
use crate::server::ServerInstance;
use crate::worker::Worker;

/// Outcome of a stop signal delivered to a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignalResult {
    /// The service finished stopping synchronously.
    Stopped,
    /// The service stops in the background and will report through
    /// [`ServerInstance::notify_service_stopped`].
    Pending,
}

pub trait Service: Send + Sync {
    fn initialize(&self, server: &Arc<ServerInstance>) -> Result<(), RuntimeError> {
        let _ = server;
        Ok(())
    }

    /// All worker groups are up; safe to defer tasks and open traffic.
    fn on_server_started(&self, server: &Arc<ServerInstance>) {
        let _ = server;
    }

    /// The server began shutting down. Return [`StopSignalResult::Pending`]
    /// to finish asynchronously; worker groups stay up until every service
    /// has reported stopped.
    fn on_server_stop_signaled(&self) -> StopSignalResult {
        StopSignalResult::Stopped
    }

    /// Invoked exactly once, after every group has stopped, regardless of
    /// the stop reason.
    fn on_server_stopped(&self) {}
}

pub trait SimpleService: Service {}

pub trait AodService: Service {}

pub trait ActiveService: Service {
    /// Ticked by the server's active-service task while the server runs.
    fn on_tick(&self);
}

pub trait WorkerService: Service {
    fn on_worker_started(&self, worker: &Worker, group: &WorkerGroup) {
        let _ = (worker, group);
    }

    fn on_worker_stopped(&self, worker: &Worker, group: &WorkerGroup) {
        let _ = (worker, group);
    }

    /// Runs every iteration on workers whose group ticks services.
    fn on_tick_worker(&self, worker: &Worker, group: &WorkerGroup) {
        let _ = (worker, group);
    }
}
