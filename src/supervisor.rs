use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::definition::{ProcessDefinition, ProcessId};
use crate::event::channel::EventPublisher;
use crate::ports::PortProbe;
use crate::runner::{LinkToken, NotStartedRunner, RunnerDown, RunnerError, RunnerHandle};

/// Time a runner gets to terminate before it is force-killed.
pub const SHUTDOWN_BUDGET: Duration = Duration::from_secs(10);

/// Safety net below the manager-level restart policy: at most this many
/// restarts of the same id within [`RESTART_INTENSITY_WINDOW`].
const MAX_RESTART_INTENSITY: usize = 3;
const RESTART_INTENSITY_WINDOW: Duration = Duration::from_secs(5);

const TERMINATION_POLL: Duration = Duration::from_millis(100);
const FORCE_KILL_GRACE: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("no runner registered for `{0}`")]
    NotFound(ProcessId),

    #[error("restart intensity exceeded for `{0}`")]
    RestartIntensityExceeded(ProcessId),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("runner for `{0}` did not terminate within the shutdown budget")]
    StopTimeout(ProcessId),
}

struct SupervisedRunner {
    handle: RunnerHandle,
    thread: JoinHandle<()>,
}

#[derive(Default)]
struct SupervisorInner {
    runners: HashMap<ProcessId, SupervisedRunner>,
    recent_starts: HashMap<ProcessId, VecDeque<Instant>>,
}

/// Owns the collection of runner threads: starts them on demand, bounds
/// restart intensity per id, and terminates them within the shutdown budget.
/// The restart *policy* lives in the manager; this layer is intentionally
/// thin.
pub struct Supervisor {
    inner: Mutex<SupervisorInner>,
    down_publisher: EventPublisher<RunnerDown>,
    port_probe: Arc<dyn PortProbe + Send + Sync>,
    next_token: AtomicU64,
}

impl Supervisor {
    pub fn new(
        down_publisher: EventPublisher<RunnerDown>,
        port_probe: Arc<dyn PortProbe + Send + Sync>,
    ) -> Self {
        Self {
            inner: Mutex::default(),
            down_publisher,
            port_probe,
            next_token: AtomicU64::new(1),
        }
    }

    /// Spawns a runner for the definition. Exceeding the per-id restart
    /// intensity refuses the start so a crash-looping child cannot spin.
    pub fn start_runner(
        &self,
        definition: &ProcessDefinition,
        restart_count: u32,
    ) -> Result<RunnerHandle, SupervisorError> {
        let id = definition.id.clone();

        {
            let mut inner = self.inner.lock().expect("supervisor lock poisoned");
            let starts = inner.recent_starts.entry(id.clone()).or_default();
            let now = Instant::now();
            while starts
                .front()
                .is_some_and(|t| now.duration_since(*t) > RESTART_INTENSITY_WINDOW)
            {
                starts.pop_front();
            }
            if starts.len() > MAX_RESTART_INTENSITY {
                warn!(process = %id, "refusing start, restart intensity exceeded");
                return Err(SupervisorError::RestartIntensityExceeded(id));
            }
            starts.push_back(now);
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let runner = NotStartedRunner::new(
            definition.clone(),
            token,
            restart_count,
            self.down_publisher.clone(),
        );
        let (handle, thread) = runner.start(self.port_probe.as_ref())?;

        let mut inner = self.inner.lock().expect("supervisor lock poisoned");
        if let Some(stale) = inner.runners.insert(
            id.clone(),
            SupervisedRunner {
                handle: handle.clone(),
                thread,
            },
        ) {
            // a finished predecessor whose exit was already processed
            reap(stale, &id);
        }
        debug!(process = %id, token, "runner registered");
        Ok(handle)
    }

    /// Requests a graceful stop and waits for the runner to terminate within
    /// the shutdown budget; force-kills on overrun. The entry is removed
    /// either way.
    pub fn terminate_runner(&self, id: &ProcessId) -> Result<(), SupervisorError> {
        let entry = {
            let mut inner = self.inner.lock().expect("supervisor lock poisoned");
            inner
                .runners
                .remove(id)
                .ok_or_else(|| SupervisorError::NotFound(id.clone()))?
        };

        entry.handle.request_graceful_shutdown();

        let deadline = Instant::now() + SHUTDOWN_BUDGET;
        while Instant::now() < deadline {
            if entry.thread.is_finished() {
                let _ = entry.thread.join();
                info!(process = %id, "runner terminated");
                return Ok(());
            }
            std::thread::sleep(TERMINATION_POLL);
        }

        warn!(process = %id, "shutdown budget elapsed, force-killing runner");
        entry.handle.force_kill();

        // short grace for the runner thread to observe the kill
        let grace_deadline = Instant::now() + FORCE_KILL_GRACE;
        while Instant::now() < grace_deadline && !entry.thread.is_finished() {
            std::thread::sleep(TERMINATION_POLL);
        }
        if entry.thread.is_finished() {
            let _ = entry.thread.join();
        }
        Err(SupervisorError::StopTimeout(id.clone()))
    }

    /// Reaps the entry for a runner whose terminal notification was processed.
    /// A stale token (a newer runner took the id) leaves the entry alone.
    pub fn remove_runner(&self, id: &ProcessId, token: LinkToken) {
        let entry = {
            let mut inner = self.inner.lock().expect("supervisor lock poisoned");
            match inner.runners.get(id) {
                Some(existing) if existing.handle.token() == token => inner.runners.remove(id),
                _ => None,
            }
        };
        if let Some(entry) = entry {
            reap(entry, id);
        }
    }

    pub fn runner_count(&self) -> usize {
        self.inner
            .lock()
            .expect("supervisor lock poisoned")
            .runners
            .len()
    }
}

fn reap(entry: SupervisedRunner, id: &ProcessId) {
    if entry.thread.is_finished() {
        let _ = entry.thread.join();
    } else {
        // runner thread is still draining; it owns no shared state that
        // outlives it, so detaching is safe
        debug!(process = %id, "detaching still-running runner thread");
    }
}

#[cfg(target_family = "unix")]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::definition::tests::sleep_definition;
    use crate::event::channel::pub_sub;
    use crate::ports::MockPortProbe;
    use assert_matches::assert_matches;

    fn test_supervisor() -> (Supervisor, crate::event::channel::EventConsumer<RunnerDown>) {
        let (down_tx, down_rx) = pub_sub();
        let mut probe = MockPortProbe::new();
        probe.expect_ports_in_use().returning(|_| Vec::new());
        (Supervisor::new(down_tx, Arc::new(probe)), down_rx)
    }

    #[test]
    fn start_and_terminate_a_runner() {
        let (supervisor, _down_rx) = test_supervisor();
        let def = sleep_definition("svc");

        let handle = supervisor.start_runner(&def, 0).unwrap();
        assert!(handle.os_pid().is_some());
        assert_eq!(supervisor.runner_count(), 1);

        supervisor.terminate_runner(&def.id).unwrap();
        assert_eq!(supervisor.runner_count(), 0);
    }

    #[test]
    fn terminating_an_unknown_runner_fails() {
        let (supervisor, _down_rx) = test_supervisor();
        let id: ProcessId = "missing".to_string().try_into().unwrap();

        assert_matches!(
            supervisor.terminate_runner(&id),
            Err(SupervisorError::NotFound(_))
        );
    }

    #[test]
    fn tokens_are_unique_per_start() {
        let (supervisor, down_rx) = test_supervisor();
        let def = sleep_definition("token-check");

        let first = supervisor.start_runner(&def, 0).unwrap();
        supervisor.terminate_runner(&def.id).unwrap();
        down_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        let second = supervisor.start_runner(&def, 0).unwrap();
        assert_ne!(first.token(), second.token());
        supervisor.terminate_runner(&def.id).unwrap();
    }

    #[test]
    fn restart_intensity_is_bounded() {
        let (supervisor, down_rx) = test_supervisor();
        let mut def = sleep_definition("flappy");
        def.command = "sh".to_string();
        def.args = vec!["-c".to_string(), "exit 1".to_string()];

        // initial start plus MAX_RESTART_INTENSITY restarts are allowed
        for _ in 0..=MAX_RESTART_INTENSITY {
            supervisor.start_runner(&def, 0).unwrap();
            down_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        }

        assert_matches!(
            supervisor.start_runner(&def, 0),
            Err(SupervisorError::RestartIntensityExceeded(_))
        );
    }
}
