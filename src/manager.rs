pub mod restart;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, select, Receiver, Sender};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::definition::{ProcessDefinition, ProcessId};
use crate::event::channel::{EventConsumer, EventPublisher};
use crate::event::ProcessEvent;
use crate::registry::Registry;
use crate::runner::{ExitReason, LinkToken, ProcessStatus, RunnerDown, RunnerError, RunnerHandle};
use crate::supervisor::{Supervisor, SupervisorError};
use restart::RestartBudget;

use crate::utils::threads::spawn_named_thread;

/// Delay before an auto-restart attempt fires; a natural fence against
/// thundering crash loops.
pub const AUTO_RESTART_DELAY: Duration = Duration::from_millis(1000);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ManagerError {
    #[error("process not found")]
    NotFound,

    #[error("process already running")]
    AlreadyRunning,

    #[error("process not running")]
    NotRunning,

    #[error("stop timed out")]
    StopTimeout,

    #[error("invalid process definition: {0}")]
    InvalidConfig(String),

    #[error("declared ports already in use: {0:?}")]
    PortInUse(Vec<u16>),

    #[error("executable `{0}` not found")]
    ExecutableNotFound(String),

    #[error("not startable on this platform")]
    PlatformMismatch,

    #[error("spawn failed: {0}")]
    SpawnError(String),

    #[error("restart intensity exceeded")]
    RestartIntensityExceeded,

    #[error("manager is gone")]
    ChannelClosed,
}

impl From<SupervisorError> for ManagerError {
    fn from(value: SupervisorError) -> Self {
        match value {
            SupervisorError::NotFound(_) => ManagerError::NotRunning,
            SupervisorError::RestartIntensityExceeded(_) => ManagerError::RestartIntensityExceeded,
            SupervisorError::StopTimeout(_) => ManagerError::StopTimeout,
            SupervisorError::Runner(err) => match err {
                RunnerError::PlatformMismatch(_) => ManagerError::PlatformMismatch,
                RunnerError::ExecutableNotFound(cmd) => ManagerError::ExecutableNotFound(cmd),
                RunnerError::PortInUse(ports) => ManagerError::PortInUse(ports),
                RunnerError::Spawn(inner) => ManagerError::SpawnError(inner),
                RunnerError::NotRunning => ManagerError::NotRunning,
            },
        }
    }
}

/// One row of `list_processes`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProcessSummary {
    pub id: ProcessId,
    pub name: String,
    pub status: ProcessStatus,
}

enum AfterStop {
    Reply(Sender<Result<(), ManagerError>>),
    ThenStart(Sender<Result<(), ManagerError>>),
    ThenRemove(Sender<Result<(), ManagerError>>),
}

enum ManagerRequest {
    Add(ProcessDefinition, Sender<Result<(), ManagerError>>),
    Remove(ProcessId, Sender<Result<(), ManagerError>>),
    Start(ProcessId, Sender<Result<(), ManagerError>>),
    Stop(ProcessId, Sender<Result<(), ManagerError>>),
    Restart(ProcessId, Sender<Result<(), ManagerError>>),
    Status(ProcessId, Sender<Result<ProcessStatus, ManagerError>>),
    List(Sender<Vec<ProcessSummary>>),
    Shutdown(Sender<()>),
}

impl ManagerRequest {
    /// Id whose per-id ordering this request participates in. Observers
    /// (status, list) and table edits without a live runner are not queued
    /// behind in-flight stops.
    fn ordered_id(&self) -> Option<&ProcessId> {
        match self {
            ManagerRequest::Remove(id, _)
            | ManagerRequest::Start(id, _)
            | ManagerRequest::Stop(id, _)
            | ManagerRequest::Restart(id, _) => Some(id),
            _ => None,
        }
    }
}

enum InternalEvent {
    RestartDue(ProcessId),
    StopFinished {
        id: ProcessId,
        outcome: Result<(), ManagerError>,
        after: AfterStop,
    },
}

struct MonitorEntry {
    handle: RunnerHandle,
    token: LinkToken,
    link_dissolved: bool,
}

/// Typed façade over the manager task. Cloneable and cheap; every call is
/// serialized through the manager's single channel.
#[derive(Clone)]
pub struct ManagerHandle {
    requests: Sender<ManagerRequest>,
}

impl ManagerHandle {
    fn call<T>(
        &self,
        build: impl FnOnce(Sender<T>) -> ManagerRequest,
    ) -> Result<T, ManagerError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.requests
            .send(build(reply_tx))
            .map_err(|_| ManagerError::ChannelClosed)?;
        reply_rx.recv().map_err(|_| ManagerError::ChannelClosed)
    }

    pub fn add_process(&self, definition: ProcessDefinition) -> Result<(), ManagerError> {
        self.call(|tx| ManagerRequest::Add(definition, tx))?
    }

    pub fn remove_process(&self, id: &ProcessId) -> Result<(), ManagerError> {
        self.call(|tx| ManagerRequest::Remove(id.clone(), tx))?
    }

    pub fn start_process(&self, id: &ProcessId) -> Result<(), ManagerError> {
        self.call(|tx| ManagerRequest::Start(id.clone(), tx))?
    }

    pub fn stop_process(&self, id: &ProcessId) -> Result<(), ManagerError> {
        self.call(|tx| ManagerRequest::Stop(id.clone(), tx))?
    }

    pub fn restart_process(&self, id: &ProcessId) -> Result<(), ManagerError> {
        self.call(|tx| ManagerRequest::Restart(id.clone(), tx))?
    }

    pub fn get_process_status(&self, id: &ProcessId) -> Result<ProcessStatus, ManagerError> {
        self.call(|tx| ManagerRequest::Status(id.clone(), tx))?
    }

    pub fn list_processes(&self) -> Result<Vec<ProcessSummary>, ManagerError> {
        self.call(ManagerRequest::List)
    }

    /// Stops every supervised process and ends the manager task.
    pub fn shutdown(&self) -> Result<(), ManagerError> {
        self.call(ManagerRequest::Shutdown)
    }
}

/// Single-writer coordinator of the per-node process lifecycle. All state
/// mutations happen on its own thread; observers always see a consistent
/// snapshot.
pub struct Manager {
    definitions: HashMap<ProcessId, ProcessDefinition>,
    monitors: HashMap<ProcessId, MonitorEntry>,
    budgets: HashMap<ProcessId, RestartBudget>,
    /// Queued requests per id with an in-flight stop; presence marks the id
    /// busy.
    pending: HashMap<ProcessId, VecDeque<ManagerRequest>>,
    supervisor: Arc<Supervisor>,
    registry: Arc<Registry>,
    events: EventPublisher<ProcessEvent>,
    internal_tx: Sender<InternalEvent>,
}

impl Manager {
    /// Starts the manager task over the declared process table. The returned
    /// handle is the only way in; `down_consumer` feeds runner exit
    /// notifications.
    pub fn spawn(
        definitions: Vec<ProcessDefinition>,
        supervisor: Arc<Supervisor>,
        registry: Arc<Registry>,
        events: EventPublisher<ProcessEvent>,
        down_consumer: EventConsumer<RunnerDown>,
    ) -> (ManagerHandle, JoinHandle<()>) {
        let (requests_tx, requests_rx) = crossbeam::channel::unbounded();
        let (internal_tx, internal_rx) = crossbeam::channel::unbounded();

        let manager = Manager {
            definitions: definitions
                .into_iter()
                .map(|def| (def.id.clone(), def))
                .collect(),
            monitors: HashMap::new(),
            budgets: HashMap::new(),
            pending: HashMap::new(),
            supervisor,
            registry,
            events,
            internal_tx,
        };

        let thread = spawn_named_thread("process-manager", move || {
            manager.run(requests_rx, internal_rx, down_consumer)
        });

        (
            ManagerHandle {
                requests: requests_tx,
            },
            thread,
        )
    }

    fn run(
        mut self,
        requests: Receiver<ManagerRequest>,
        internal_rx: Receiver<InternalEvent>,
        down_consumer: EventConsumer<RunnerDown>,
    ) {
        info!(declared = self.definitions.len(), "process manager started");
        loop {
            select! {
                recv(requests) -> msg => match msg {
                    Ok(request) => {
                        // fold in already-queued exit notifications first, so
                        // a start never sees a dead predecessor as running
                        while let Ok(down) = down_consumer.as_ref().try_recv() {
                            self.handle_runner_down(down);
                        }
                        if !self.dispatch(request) {
                            break;
                        }
                    }
                    // every handle dropped: stop supervising and wind down
                    Err(_) => {
                        self.shutdown_all();
                        break;
                    }
                },
                recv(internal_rx) -> msg => {
                    if let Ok(event) = msg {
                        self.handle_internal(event);
                    }
                },
                recv(down_consumer.as_ref()) -> msg => {
                    if let Ok(down) = msg {
                        self.handle_runner_down(down);
                    }
                },
            }
        }
        info!("process manager stopped");
    }

    /// Routes one request; returns false when the manager should wind down.
    /// Requests targeting a busy id are parked and replayed in arrival order.
    fn dispatch(&mut self, request: ManagerRequest) -> bool {
        if let Some(id) = request.ordered_id() {
            if let Some(queue) = self.pending.get_mut(id) {
                queue.push_back(request);
                return true;
            }
        }

        match request {
            ManagerRequest::Add(definition, reply) => {
                let _ = reply.send(self.add_process(definition));
            }
            ManagerRequest::Remove(id, reply) => self.handle_remove(id, reply),
            ManagerRequest::Start(id, reply) => {
                let _ = reply.send(self.start_process(&id));
            }
            ManagerRequest::Stop(id, reply) => self.handle_stop(id, reply),
            ManagerRequest::Restart(id, reply) => self.handle_restart(id, reply),
            ManagerRequest::Status(id, reply) => {
                let _ = reply.send(self.status(&id));
            }
            ManagerRequest::List(reply) => {
                let _ = reply.send(self.list());
            }
            ManagerRequest::Shutdown(reply) => {
                self.shutdown_all();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::RestartDue(id) => self.handle_restart_due(id),
            InternalEvent::StopFinished { id, outcome, after } => {
                self.handle_stop_finished(id, outcome, after)
            }
        }
    }

    fn add_process(&mut self, definition: ProcessDefinition) -> Result<(), ManagerError> {
        definition
            .validate()
            .map_err(|err| ManagerError::InvalidConfig(err.to_string()))?;
        if self.definitions.contains_key(&definition.id) {
            return Err(ManagerError::InvalidConfig(format!(
                "duplicate process id `{}`",
                definition.id
            )));
        }
        info!(process = %definition.id, "process definition added");
        self.definitions.insert(definition.id.clone(), definition);
        Ok(())
    }

    fn handle_remove(&mut self, id: ProcessId, reply: Sender<Result<(), ManagerError>>) {
        if !self.definitions.contains_key(&id) {
            let _ = reply.send(Err(ManagerError::NotFound));
            return;
        }
        if self.monitors.contains_key(&id) {
            self.begin_stop(id, AfterStop::ThenRemove(reply));
        } else {
            self.definitions.remove(&id);
            self.budgets.remove(&id);
            info!(process = %id, "process definition removed");
            let _ = reply.send(Ok(()));
        }
    }

    fn start_process(&mut self, id: &ProcessId) -> Result<(), ManagerError> {
        let definition = self.definitions.get(id).ok_or(ManagerError::NotFound)?.clone();
        if self.monitors.contains_key(id) {
            return Err(ManagerError::AlreadyRunning);
        }

        // a manual start forgives past crashes
        self.budgets.remove(id);

        let handle = self
            .supervisor
            .start_runner(&definition, 0)
            .map_err(ManagerError::from)?;
        self.register_monitor(id.clone(), handle);
        Ok(())
    }

    fn register_monitor(&mut self, id: ProcessId, handle: RunnerHandle) {
        let token = handle.token();
        let _ = self.registry.unregister(&id);
        if let Err(err) = self.registry.register(id.clone(), handle.clone()) {
            warn!(process = %id, "registry insert failed: {err}");
        }
        self.monitors.insert(
            id.clone(),
            MonitorEntry {
                handle,
                token,
                link_dissolved: false,
            },
        );
        self.publish(ProcessEvent::Started { id });
    }

    fn handle_stop(&mut self, id: ProcessId, reply: Sender<Result<(), ManagerError>>) {
        if !self.monitors.contains_key(&id) {
            let _ = reply.send(Err(ManagerError::NotRunning));
            return;
        }
        self.begin_stop(id, AfterStop::Reply(reply));
    }

    fn handle_restart(&mut self, id: ProcessId, reply: Sender<Result<(), ManagerError>>) {
        if self.monitors.contains_key(&id) {
            self.begin_stop(id, AfterStop::ThenStart(reply));
        } else if self.definitions.contains_key(&id) {
            // restarting a stopped process is just a start
            let _ = reply.send(self.start_process(&id));
        } else {
            let _ = reply.send(Err(ManagerError::NotFound));
        }
    }

    /// Dissolves the lifecycle link (so the imminent exit is not a crash),
    /// marks the id busy, and offloads the bounded graceful wait to a worker
    /// thread. The manager loop keeps serving other ids meanwhile.
    fn begin_stop(&mut self, id: ProcessId, after: AfterStop) {
        if let Some(entry) = self.monitors.get_mut(&id) {
            entry.link_dissolved = true;
        }
        self.pending.insert(id.clone(), VecDeque::new());

        let supervisor = self.supervisor.clone();
        let internal_tx = self.internal_tx.clone();
        spawn_named_thread(format!("stop-{}", id), move || {
            let outcome = match supervisor.terminate_runner(&id) {
                Ok(()) => Ok(()),
                // the runner exited on its own while the stop was in flight
                Err(SupervisorError::NotFound(_)) => Ok(()),
                Err(SupervisorError::StopTimeout(_)) => Err(ManagerError::StopTimeout),
                Err(err) => Err(ManagerError::from(err)),
            };
            let _ = internal_tx.send(InternalEvent::StopFinished { id, outcome, after });
        });
    }

    fn handle_stop_finished(
        &mut self,
        id: ProcessId,
        outcome: Result<(), ManagerError>,
        after: AfterStop,
    ) {
        if let Some(entry) = self.monitors.remove(&id) {
            let _ = self.registry.unregister(&id);
            self.supervisor.remove_runner(&id, entry.token);
        }
        self.publish(ProcessEvent::Stopped { id: id.clone() });

        match after {
            AfterStop::Reply(reply) => {
                let _ = reply.send(outcome);
            }
            AfterStop::ThenStart(reply) => {
                // a failed stop step fails the whole restart
                let result = outcome.and_then(|()| self.start_process(&id));
                let _ = reply.send(result);
            }
            AfterStop::ThenRemove(reply) => {
                self.definitions.remove(&id);
                self.budgets.remove(&id);
                info!(process = %id, "process definition removed");
                let _ = reply.send(outcome);
            }
        }

        self.drain_pending(&id);
    }

    fn drain_pending(&mut self, id: &ProcessId) {
        let Some(queue) = self.pending.remove(id) else {
            return;
        };
        for request in queue {
            // a drained stop/restart may mark the id busy again, re-parking
            // the remainder in order
            self.dispatch(request);
        }
    }

    fn handle_runner_down(&mut self, down: RunnerDown) {
        let RunnerDown { id, token, reason } = down;

        let Some(entry) = self.monitors.get(&id) else {
            self.supervisor.remove_runner(&id, token);
            return;
        };
        if entry.token != token {
            debug!(process = %id, token, "ignoring stale exit notification");
            self.supervisor.remove_runner(&id, token);
            return;
        }

        let dissolved = entry.link_dissolved;

        // the entry goes away before any restart is scheduled
        self.monitors.remove(&id);
        let _ = self.registry.unregister(&id);
        self.supervisor.remove_runner(&id, token);

        if dissolved {
            // a requested stop; the stop worker owns the reply and the event
            return;
        }

        if reason == ExitReason::Normal {
            info!(process = %id, "process exited");
            self.publish(ProcessEvent::Stopped { id });
            return;
        }

        warn!(process = %id, reason = %reason, "process crashed");
        self.publish(ProcessEvent::Crashed {
            id: id.clone(),
            reason,
        });

        let Some(definition) = self.definitions.get(&id) else {
            return;
        };
        if !definition.auto_restart {
            return;
        }

        let budget = self
            .budgets
            .entry(id.clone())
            .or_insert_with(|| RestartBudget::from_definition(definition));
        if budget.allows_attempt(Instant::now()) {
            self.publish(ProcessEvent::AutoRestartScheduled {
                id: id.clone(),
                delay: AUTO_RESTART_DELAY,
            });
            schedule_restart(self.internal_tx.clone(), id);
        } else {
            warn!(process = %id, "auto-restart budget exhausted, leaving process stopped");
            self.publish(ProcessEvent::AutoRestartExhausted { id });
        }
    }

    fn handle_restart_due(&mut self, id: ProcessId) {
        if self.pending.contains_key(&id) {
            // a stop raced the scheduled restart; the operator wins
            return;
        }
        let Some(definition) = self.definitions.get(&id).cloned() else {
            return;
        };
        if !definition.auto_restart || self.monitors.contains_key(&id) {
            return;
        }

        let now = Instant::now();
        let budget = self
            .budgets
            .entry(id.clone())
            .or_insert_with(|| RestartBudget::from_definition(&definition));
        budget.record_attempt(now);
        let restart_count = budget.attempt_count(now) as u32;

        match self.supervisor.start_runner(&definition, restart_count) {
            Ok(handle) => {
                info!(process = %id, restart_count, "process auto-restarted");
                self.register_monitor(id, handle);
            }
            Err(SupervisorError::RestartIntensityExceeded(_)) => {
                warn!(process = %id, "supervisor refused the auto-restart");
                self.publish(ProcessEvent::RestartIntensityExceeded { id });
            }
            // auto-restart failures are telemetry, never surfaced to callers
            Err(err) => {
                warn!(process = %id, "auto-restart failed: {err}");
            }
        }
    }

    fn status(&self, id: &ProcessId) -> Result<ProcessStatus, ManagerError> {
        if !self.definitions.contains_key(id) {
            return Err(ManagerError::NotFound);
        }
        Ok(self.observed_status(id))
    }

    /// A monitored id reports its live runner status; anything terminal or
    /// unmonitored reads as stopped, so no observer ever sees "running" with
    /// a dead pid.
    fn observed_status(&self, id: &ProcessId) -> ProcessStatus {
        match self.monitors.get(id) {
            Some(entry) => {
                let status = entry.handle.status();
                if status.is_terminal() {
                    ProcessStatus::Stopped
                } else {
                    status
                }
            }
            None => ProcessStatus::Stopped,
        }
    }

    fn list(&self) -> Vec<ProcessSummary> {
        let mut summaries: Vec<ProcessSummary> = self
            .definitions
            .values()
            .map(|def| ProcessSummary {
                id: def.id.clone(),
                name: def.name.clone(),
                status: self.observed_status(&def.id),
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    fn shutdown_all(&mut self) {
        let ids: Vec<ProcessId> = self.monitors.keys().cloned().collect();
        if !ids.is_empty() {
            info!(count = ids.len(), "stopping all supervised processes");
        }
        for id in ids {
            if let Some(entry) = self.monitors.get_mut(&id) {
                entry.link_dissolved = true;
            }
            // ids with an in-flight stop are already being terminated
            if !self.pending.contains_key(&id) {
                if let Err(err) = self.supervisor.terminate_runner(&id) {
                    warn!(process = %id, "stop during shutdown failed: {err}");
                }
            }
            self.monitors.remove(&id);
            let _ = self.registry.unregister(&id);
        }
    }

    fn publish(&self, event: ProcessEvent) {
        if self.events.publish(event).is_err() {
            debug!("telemetry consumer is gone, dropping event");
        }
    }
}

fn schedule_restart(internal_tx: Sender<InternalEvent>, id: ProcessId) {
    spawn_named_thread(format!("restart-timer-{}", id), move || {
        std::thread::sleep(AUTO_RESTART_DELAY);
        let _ = internal_tx.send(InternalEvent::RestartDue(id));
    });
}
