use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};

use super::CommandError;

////////////////////////////////////////////////////////////////////////////////////
// States for a not-started / started child
////////////////////////////////////////////////////////////////////////////////////

/// A configured but not yet spawned OS child. The declared environment is
/// overlaid on the agent's own environment.
pub struct ChildCommand {
    cmd: Command,
}

/// A spawned OS child. Owns the `Child` handle and its piped stdio streams
/// until they are taken for forwarding.
pub struct StartedChild {
    child: Child,
}

impl ChildCommand {
    pub fn new(program: &Path, args: &[String]) -> Self {
        let mut cmd = Command::new(program);
        cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
        Self { cmd }
    }

    pub fn with_cwd(mut self, cwd: Option<&PathBuf>) -> Self {
        if let Some(dir) = cwd {
            self.cmd.current_dir(dir);
        }
        self
    }

    pub fn with_env(mut self, env: &HashMap<String, String>) -> Self {
        self.cmd.envs(env);
        self
    }

    pub fn spawn(mut self) -> Result<StartedChild, CommandError> {
        Ok(StartedChild {
            child: self.cmd.spawn()?,
        })
    }
}

impl StartedChild {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Non-blocking exit probe; `None` while the child is still running.
    pub fn try_status(&mut self) -> Result<Option<ExitStatus>, CommandError> {
        self.child.try_wait().map_err(CommandError::from)
    }

    pub fn is_running(&mut self) -> bool {
        self.child.try_wait().is_ok_and(|status| status.is_none())
    }

    /// Blocks until the child exits and reaps it.
    pub fn wait(&mut self) -> Result<ExitStatus, CommandError> {
        self.child.wait().map_err(CommandError::from)
    }

    pub fn kill(&mut self) -> Result<(), CommandError> {
        self.child.kill().map_err(CommandError::from)
    }

    pub fn take_stdout(&mut self) -> Result<ChildStdout, CommandError> {
        self.child
            .stdout
            .take()
            .ok_or(CommandError::StreamPipeError("stdout".to_string()))
    }

    pub fn take_stderr(&mut self) -> Result<ChildStderr, CommandError> {
        self.child
            .stderr
            .take()
            .ok_or(CommandError::StreamPipeError("stderr".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::executable::resolve_executable;
    use std::io::Read;

    #[cfg(unix)]
    #[test]
    fn spawn_wait_and_exit_status() {
        let program = resolve_executable("sh").unwrap();
        let mut child = ChildCommand::new(&program, &["-c".to_string(), "exit 3".to_string()])
            .spawn()
            .unwrap();

        let status = child.wait().unwrap();
        assert_eq!(status.code(), Some(3));
        assert!(!child.is_running());
    }

    #[cfg(unix)]
    #[test]
    fn declared_env_is_overlaid() {
        let program = resolve_executable("sh").unwrap();
        let env = HashMap::from([("NURVUS_CHILD_TEST".to_string(), "42".to_string())]);
        let mut child = ChildCommand::new(
            &program,
            &["-c".to_string(), "printf %s \"$NURVUS_CHILD_TEST\"".to_string()],
        )
        .with_env(&env)
        .spawn()
        .unwrap();

        let mut stdout = child.take_stdout().unwrap();
        child.wait().unwrap();

        let mut output = String::new();
        stdout.read_to_string(&mut output).unwrap();
        assert_eq!(output, "42");
    }

    #[cfg(unix)]
    #[test]
    fn running_child_reports_running_until_killed() {
        let program = resolve_executable("sleep").unwrap();
        let mut child = ChildCommand::new(&program, &["30".to_string()])
            .spawn()
            .unwrap();

        assert!(child.is_running());
        child.kill().unwrap();
        child.wait().unwrap();
        assert!(!child.is_running());
    }
}
