use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, select, tick, Receiver, Sender};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::definition::{ProcessDefinition, ProcessId};
use crate::event::channel::EventPublisher;
use crate::ports::{ports_from_env, PortProbe};
use crate::process::child::{ChildCommand, StartedChild};
use crate::process::executable::resolve_executable;
use crate::process::output::{spawn_output_forwarder, StreamKind};
use crate::process::terminator::{spawn_stop_command, ProcessTerminator, StopSignal};
use crate::process::CommandError;
use crate::utils::threads::spawn_named_thread;

/// Interval between SIGTERM (or the stop command) and SIGKILL.
pub const GRACEFUL_WINDOW: Duration = Duration::from_secs(5);
const LIVENESS_POLL: Duration = Duration::from_millis(100);

/// Token correlating a runner's exit notification with the monitor entry that
/// registered it. Minted per start; stale tokens are ignored by the manager.
pub type LinkToken = u64;

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessStatus::Stopped | ProcessStatus::Failed)
    }

    pub fn is_alive(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProcessStatus::Starting => "starting",
            ProcessStatus::Running => "running",
            ProcessStatus::Stopping => "stopping",
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Why a supervised child is gone.
#[derive(Clone, Debug, PartialEq)]
pub enum ExitReason {
    /// Voluntary exit (code 0) or a completed requested stop.
    Normal,
    /// Unrequested exit with a non-zero code.
    ExitStatus(i32),
    /// Terminated by a signal, including our own SIGKILL escalation.
    Killed,
    /// The child never came up.
    SpawnError(String),
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Normal => write!(f, "normal"),
            ExitReason::ExitStatus(code) => write!(f, "exit status {}", code),
            ExitReason::Killed => write!(f, "killed"),
            ExitReason::SpawnError(err) => write!(f, "spawn error: {}", err),
        }
    }
}

/// The single terminal notification a runner emits.
#[derive(Debug)]
pub struct RunnerDown {
    pub id: ProcessId,
    pub token: LinkToken,
    pub reason: ExitReason,
}

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("`{0}` is not startable on this platform")]
    PlatformMismatch(ProcessId),

    #[error("executable `{0}` not found")]
    ExecutableNotFound(String),

    #[error("declared ports already in use: {0:?}")]
    PortInUse(Vec<u16>),

    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("process not running")]
    NotRunning,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunnerInfo {
    pub id: ProcessId,
    pub name: String,
    pub os_pid: Option<u32>,
    pub uptime_seconds: u64,
    pub restart_count: u32,
    pub status: ProcessStatus,
}

enum RunnerControl {
    Shutdown,
    Signal(StopSignal),
    Info(Sender<RunnerInfo>),
}

#[derive(Debug)]
struct RunnerShared {
    status: ProcessStatus,
    os_pid: Option<u32>,
    started_at: Instant,
    restart_count: u32,
}

/// Address of a live runner. Cloneable; the runner thread exclusively owns the
/// child handle, this only carries the control channel and a status snapshot.
#[derive(Clone, Debug)]
pub struct RunnerHandle {
    id: ProcessId,
    token: LinkToken,
    control: Sender<RunnerControl>,
    shared: Arc<Mutex<RunnerShared>>,
}

impl RunnerHandle {
    pub fn id(&self) -> &ProcessId {
        &self.id
    }

    pub fn token(&self) -> LinkToken {
        self.token
    }

    pub fn status(&self) -> ProcessStatus {
        self.shared
            .lock()
            .map(|shared| shared.status)
            .unwrap_or(ProcessStatus::Failed)
    }

    pub fn os_pid(&self) -> Option<u32> {
        self.shared.lock().ok().and_then(|shared| shared.os_pid)
    }

    pub fn is_terminated(&self) -> bool {
        self.status().is_terminal()
    }

    /// Asynchronously initiates the graceful stop sequence. Idempotent; a
    /// runner that is already gone ignores the request.
    pub fn request_graceful_shutdown(&self) {
        let _ = self.control.send(RunnerControl::Shutdown);
    }

    pub fn signal(&self, signal: StopSignal) -> Result<(), RunnerError> {
        self.control
            .send(RunnerControl::Signal(signal))
            .map_err(|_| RunnerError::NotRunning)
    }

    pub fn info(&self) -> Result<RunnerInfo, RunnerError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.control
            .send(RunnerControl::Info(reply_tx))
            .map_err(|_| RunnerError::NotRunning)?;
        reply_rx.recv().map_err(|_| RunnerError::NotRunning)
    }

    /// Last-resort SIGKILL delivered straight to the OS pid, bypassing the
    /// runner thread. The runner observes the exit through its liveness tick.
    pub fn force_kill(&self) {
        if let Some(pid) = self.os_pid() {
            if let Err(err) = ProcessTerminator::new(pid).kill() {
                debug!(pid, "force kill delivered to a gone process: {err}");
            }
        }
    }
}

/// A runner that has not spawned its child yet.
pub struct NotStartedRunner {
    definition: ProcessDefinition,
    token: LinkToken,
    restart_count: u32,
    down_publisher: EventPublisher<RunnerDown>,
}

impl NotStartedRunner {
    pub fn new(
        definition: ProcessDefinition,
        token: LinkToken,
        restart_count: u32,
        down_publisher: EventPublisher<RunnerDown>,
    ) -> Self {
        Self {
            definition,
            token,
            restart_count,
            down_publisher,
        }
    }

    /// Spawns the OS child and the runner thread. Returns once the OS pid is
    /// known. A failure here is returned to the caller; no exit notification
    /// is emitted for a child that never came up.
    pub fn start(
        self,
        port_probe: &dyn PortProbe,
    ) -> Result<(RunnerHandle, JoinHandle<()>), RunnerError> {
        let def = &self.definition;

        if !def.startable_on_current_platform() {
            return Err(RunnerError::PlatformMismatch(def.id.clone()));
        }

        let program = resolve_executable(&def.command).map_err(|err| match err {
            CommandError::ExecutableNotFound(cmd) => RunnerError::ExecutableNotFound(cmd),
            other => RunnerError::Spawn(other.to_string()),
        })?;

        let declared_ports = ports_from_env(&def.env);
        if !declared_ports.is_empty() {
            let in_use = port_probe.ports_in_use(&declared_ports);
            if !in_use.is_empty() {
                return Err(RunnerError::PortInUse(in_use));
            }
        }

        let mut child = ChildCommand::new(&program, &def.args)
            .with_cwd(def.cwd.as_ref())
            .with_env(&def.env)
            .spawn()
            .map_err(|err| RunnerError::Spawn(err.to_string()))?;

        let pid = child.pid();

        let stdout = child
            .take_stdout()
            .map_err(|err| RunnerError::Spawn(err.to_string()))?;
        let stderr = child
            .take_stderr()
            .map_err(|err| RunnerError::Spawn(err.to_string()))?;
        spawn_output_forwarder(def.name.clone(), StreamKind::Stdout, stdout);
        spawn_output_forwarder(def.name.clone(), StreamKind::Stderr, stderr);

        let shared = Arc::new(Mutex::new(RunnerShared {
            status: ProcessStatus::Starting,
            os_pid: Some(pid),
            started_at: Instant::now(),
            restart_count: self.restart_count,
        }));

        let (control_tx, control_rx) = crossbeam::channel::unbounded();

        let handle = RunnerHandle {
            id: def.id.clone(),
            token: self.token,
            control: control_tx,
            shared: shared.clone(),
        };

        set_status(&shared, ProcessStatus::Running);
        info!(process = %def.id, pid, "process started");

        let thread = spawn_named_thread(format!("runner-{}", def.id), {
            let loop_state = RunnerLoop {
                id: def.id.clone(),
                name: def.name.clone(),
                token: self.token,
                stop_command: def.stop_command.clone(),
                stop_args: def.stop_args.clone(),
                cwd: def.cwd.clone(),
                env: def.env.clone(),
                child,
                shared,
                down_publisher: self.down_publisher,
            };
            move || loop_state.run(control_rx)
        });

        Ok((handle, thread))
    }
}

struct RunnerLoop {
    id: ProcessId,
    name: String,
    token: LinkToken,
    stop_command: Option<String>,
    stop_args: Vec<String>,
    cwd: Option<PathBuf>,
    env: HashMap<String, String>,
    child: StartedChild,
    shared: Arc<Mutex<RunnerShared>>,
    down_publisher: EventPublisher<RunnerDown>,
}

impl RunnerLoop {
    /// Supervises the child until it is gone: answers control messages and
    /// probes liveness every 100 ms. Emits exactly one terminal notification.
    fn run(mut self, control_rx: Receiver<RunnerControl>) {
        let liveness = tick(LIVENESS_POLL);
        let mut control_open = true;

        let reason = loop {
            if control_open {
                select! {
                    recv(control_rx) -> msg => match msg {
                        Ok(RunnerControl::Shutdown) => break self.graceful_shutdown(),
                        Ok(RunnerControl::Signal(signal)) => self.deliver_signal(signal),
                        Ok(RunnerControl::Info(reply)) => {
                            let _ = reply.send(self.snapshot());
                        }
                        // all handles dropped; keep supervising until exit
                        Err(_) => control_open = false,
                    },
                    recv(liveness) -> _ => {
                        if let Some(reason) = self.probe_exit() {
                            break reason;
                        }
                    }
                }
            } else {
                let _ = liveness.recv();
                if let Some(reason) = self.probe_exit() {
                    break reason;
                }
            }
        };

        info!(process = %self.id, reason = %reason, "process terminated");
        let down = RunnerDown {
            id: self.id.clone(),
            token: self.token,
            reason,
        };
        if self.down_publisher.publish(down).is_err() {
            debug!(process = %self.id, "exit notification dropped, manager is gone");
        }
    }

    fn deliver_signal(&self, signal: StopSignal) {
        let Some(pid) = self.pid() else { return };
        if let Err(err) = ProcessTerminator::new(pid).signal(signal) {
            warn!(process = %self.id, pid, "signal delivery failed: {err}");
        }
    }

    /// The graceful shutdown sequence: stop command (or SIGTERM), liveness
    /// poll for the graceful window, then SIGKILL. The child handle is reaped
    /// on every path.
    fn graceful_shutdown(&mut self) -> ExitReason {
        set_status(&self.shared, ProcessStatus::Stopping);
        let pid = self.child.pid();
        info!(process = %self.id, pid, "stopping process");

        let mut stop_child = None;
        match &self.stop_command {
            Some(command) => {
                match spawn_stop_command(command, &self.stop_args, self.cwd.as_ref(), &self.env, pid)
                {
                    Ok(child) => stop_child = Some(child),
                    Err(err) => {
                        warn!(
                            process = %self.id,
                            "stop command failed, falling back to SIGTERM: {err}"
                        );
                        self.deliver_signal(StopSignal::Term);
                    }
                }
            }
            None => self.deliver_signal(StopSignal::Term),
        }

        let escalated = !self.exits_within(GRACEFUL_WINDOW);
        if escalated {
            warn!(process = %self.id, pid, "graceful window elapsed, sending SIGKILL");
            let _ = self.child.kill();
        }
        let _ = self.child.wait();

        // reap the stop-command sibling so it cannot linger
        if let Some(mut sibling) = stop_child {
            if sibling.is_running() {
                let _ = sibling.kill();
            }
            let _ = sibling.wait();
        }

        set_status(&self.shared, ProcessStatus::Stopped);
        if escalated {
            ExitReason::Killed
        } else {
            ExitReason::Normal
        }
    }

    fn exits_within(&mut self, window: Duration) -> bool {
        let deadline = Instant::now() + window;
        while Instant::now() < deadline {
            if !self.child.is_running() {
                return true;
            }
            std::thread::sleep(LIVENESS_POLL);
        }
        !self.child.is_running()
    }

    /// Checks for an unrequested exit and classifies it.
    fn probe_exit(&mut self) -> Option<ExitReason> {
        match self.child.try_status() {
            Ok(Some(status)) => {
                let (final_status, reason) = classify_exit(status);
                set_status(&self.shared, final_status);
                Some(reason)
            }
            Ok(None) => None,
            Err(err) => {
                // a failed probe is logged, only an actual exit ends the runner
                warn!(process = %self.id, "liveness probe failed: {err}");
                None
            }
        }
    }

    fn pid(&self) -> Option<u32> {
        self.shared.lock().ok().and_then(|shared| shared.os_pid)
    }

    fn snapshot(&self) -> RunnerInfo {
        let shared = self.shared.lock().expect("runner state lock poisoned");
        RunnerInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            os_pid: shared.os_pid,
            uptime_seconds: shared.started_at.elapsed().as_secs(),
            restart_count: shared.restart_count,
            status: shared.status,
        }
    }
}

fn set_status(shared: &Arc<Mutex<RunnerShared>>, status: ProcessStatus) {
    if let Ok(mut guard) = shared.lock() {
        guard.status = status;
    }
}

fn classify_exit(status: ExitStatus) -> (ProcessStatus, ExitReason) {
    match status.code() {
        Some(0) => (ProcessStatus::Stopped, ExitReason::Normal),
        Some(code) => (ProcessStatus::Failed, ExitReason::ExitStatus(code)),
        // terminated by a signal
        None => (ProcessStatus::Failed, ExitReason::Killed),
    }
}

#[cfg(target_family = "unix")]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::definition::tests::sleep_definition;
    use crate::config::definition::Platform;
    use crate::event::channel::pub_sub;
    use crate::ports::MockPortProbe;
    use assert_matches::assert_matches;

    fn free_port_probe() -> MockPortProbe {
        let mut probe = MockPortProbe::new();
        probe.expect_ports_in_use().returning(|_| Vec::new());
        probe
    }

    fn start_runner(
        def: ProcessDefinition,
    ) -> (
        RunnerHandle,
        JoinHandle<()>,
        crate::event::channel::EventConsumer<RunnerDown>,
    ) {
        let (down_tx, down_rx) = pub_sub();
        let (handle, thread) = NotStartedRunner::new(def, 1, 0, down_tx)
            .start(&free_port_probe())
            .unwrap();
        (handle, thread, down_rx)
    }

    #[test]
    fn started_runner_reports_running_with_a_pid() {
        let (handle, thread, _down_rx) = start_runner(sleep_definition("long"));

        assert_eq!(handle.status(), ProcessStatus::Running);
        assert!(handle.os_pid().is_some());

        let info = handle.info().unwrap();
        assert_eq!(info.id.as_str(), "long");
        assert_eq!(info.status, ProcessStatus::Running);
        assert_eq!(info.restart_count, 0);

        handle.request_graceful_shutdown();
        thread.join().unwrap();
    }

    #[test]
    fn graceful_shutdown_of_a_cooperative_child() {
        let (handle, thread, down_rx) = start_runner(sleep_definition("coop"));

        handle.request_graceful_shutdown();
        let down = down_rx.recv_timeout(Duration::from_secs(3)).unwrap();

        assert_eq!(down.reason, ExitReason::Normal);
        assert_eq!(down.token, 1);
        assert_eq!(handle.status(), ProcessStatus::Stopped);
        thread.join().unwrap();
    }

    #[test]
    fn external_kill_is_detected_and_classified() {
        let (handle, thread, down_rx) = start_runner(sleep_definition("victim"));
        let pid = handle.os_pid().unwrap();

        ProcessTerminator::new(pid).kill().unwrap();

        let down = down_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(down.reason, ExitReason::Killed);
        assert_eq!(handle.status(), ProcessStatus::Failed);
        thread.join().unwrap();
    }

    #[test]
    fn nonzero_exit_is_a_failure() {
        let mut def = sleep_definition("crasher");
        def.command = "sh".to_string();
        def.args = vec!["-c".to_string(), "exit 7".to_string()];

        let (handle, thread, down_rx) = start_runner(def);

        let down = down_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(down.reason, ExitReason::ExitStatus(7));
        assert_eq!(handle.status(), ProcessStatus::Failed);
        thread.join().unwrap();
    }

    #[test]
    fn sigterm_ignoring_child_is_escalated_to_sigkill() {
        let mut def = sleep_definition("stubborn");
        def.command = "sh".to_string();
        def.args = vec![
            "-c".to_string(),
            "trap '' TERM; while true; do sleep 1; done".to_string(),
        ];

        let (handle, thread, down_rx) = start_runner(def);
        // give the trap a moment to install
        std::thread::sleep(Duration::from_millis(300));

        let asked_at = Instant::now();
        handle.request_graceful_shutdown();
        let down = down_rx.recv_timeout(Duration::from_secs(8)).unwrap();

        assert_eq!(down.reason, ExitReason::Killed);
        assert!(asked_at.elapsed() >= GRACEFUL_WINDOW);
        assert_eq!(handle.status(), ProcessStatus::Stopped);
        thread.join().unwrap();
    }

    #[test]
    fn stop_command_replaces_sigterm() {
        let mut def = sleep_definition("custom-stop");
        def.stop_command = Some("sh".to_string());
        def.stop_args = vec!["-c".to_string(), "kill -TERM {pid}".to_string()];

        let (handle, thread, down_rx) = start_runner(def);

        handle.request_graceful_shutdown();
        let down = down_rx.recv_timeout(Duration::from_secs(3)).unwrap();

        assert_eq!(down.reason, ExitReason::Normal);
        assert_eq!(handle.status(), ProcessStatus::Stopped);
        thread.join().unwrap();
    }

    #[test]
    fn control_calls_after_termination_answer_not_running() {
        let (handle, thread, down_rx) = start_runner(sleep_definition("short-lived"));

        handle.request_graceful_shutdown();
        down_rx.recv_timeout(Duration::from_secs(3)).unwrap();
        thread.join().unwrap();

        assert_matches!(handle.info(), Err(RunnerError::NotRunning));
        assert_matches!(handle.signal(StopSignal::Term), Err(RunnerError::NotRunning));
    }

    #[test]
    fn spawn_failure_returns_the_error_and_emits_nothing() {
        let mut def = sleep_definition("ghost");
        def.command = "definitely-not-a-real-binary".to_string();

        let (down_tx, down_rx) = pub_sub();
        let result = NotStartedRunner::new(def, 1, 0, down_tx).start(&free_port_probe());

        assert_matches!(result, Err(RunnerError::ExecutableNotFound(_)));
        assert!(down_rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn declared_port_in_use_prevents_the_spawn() {
        let mut def = sleep_definition("bound");
        def.env
            .insert("PORT".to_string(), "9999".to_string());

        let mut probe = MockPortProbe::new();
        probe
            .expect_ports_in_use()
            .returning(|_| vec![9999]);

        let (down_tx, _down_rx) = pub_sub();
        let result = NotStartedRunner::new(def, 1, 0, down_tx).start(&probe);

        assert_matches!(result, Err(RunnerError::PortInUse(ports)) if ports == vec![9999]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn platform_pinned_definition_is_rejected_elsewhere() {
        let mut def = sleep_definition("windows-only");
        def.platform = Some(Platform::Win32);

        let (down_tx, _down_rx) = pub_sub();
        let result = NotStartedRunner::new(def, 1, 0, down_tx).start(&free_port_probe());

        assert_matches!(result, Err(RunnerError::PlatformMismatch(_)));
    }
}
