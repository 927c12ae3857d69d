use std::collections::HashMap;
use std::path::PathBuf;

use super::child::{ChildCommand, StartedChild};
use super::executable::resolve_executable;
use super::CommandError;

/// Direct signals a runner accepts for a supervised child.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StopSignal {
    Term,
    Int,
    Kill,
}

/// Signal-level control over a process identified by pid. The escalation
/// policy (graceful window, SIGKILL) lives in the runner; this only delivers
/// signals.
pub struct ProcessTerminator {
    pid: u32,
}

impl ProcessTerminator {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }

    #[cfg(target_family = "unix")]
    pub fn signal(&self, signal: StopSignal) -> Result<(), CommandError> {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let sig = match signal {
            StopSignal::Term => Signal::SIGTERM,
            StopSignal::Int => Signal::SIGINT,
            StopSignal::Kill => Signal::SIGKILL,
        };
        signal::kill(Pid::from_raw(self.pid as i32), sig)
            .map_err(|err| CommandError::SignalError(err.to_string()))
    }

    #[cfg(target_family = "windows")]
    pub fn signal(&self, signal: StopSignal) -> Result<(), CommandError> {
        use std::process::Command;

        // taskkill without /F asks the process to close; /F force-terminates.
        let mut cmd = Command::new("taskkill");
        cmd.arg("/PID").arg(self.pid.to_string());
        if matches!(signal, StopSignal::Kill) {
            cmd.arg("/F");
        }
        let status = cmd.status()?;
        if !status.success() {
            return Err(CommandError::IOError(std::io::Error::other(format!(
                "taskkill exited with {status}"
            ))));
        }
        Ok(())
    }

    /// Requests a graceful stop (SIGTERM).
    pub fn terminate(&self) -> Result<(), CommandError> {
        self.signal(StopSignal::Term)
    }

    /// Force-terminates (SIGKILL).
    pub fn kill(&self) -> Result<(), CommandError> {
        self.signal(StopSignal::Kill)
    }
}

/// Spawns a declared stop command as a short-lived sibling of the supervised
/// child: same cwd and declared environment, with the `{pid}` sentinel
/// substituted in its arguments.
pub fn spawn_stop_command(
    stop_command: &str,
    stop_args: &[String],
    cwd: Option<&PathBuf>,
    env: &HashMap<String, String>,
    pid: u32,
) -> Result<StartedChild, CommandError> {
    let program = resolve_executable(stop_command)?;
    let args: Vec<String> = stop_args
        .iter()
        .map(|arg| arg.replace("{pid}", &pid.to_string()))
        .collect();

    ChildCommand::new(&program, &args)
        .with_cwd(cwd)
        .with_env(env)
        .spawn()
}
