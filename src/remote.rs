use std::path::PathBuf;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::config::definition::ProcessId;
use crate::http_server::config::ServerConfig;
use crate::http_server::status::HealthSummary;
use crate::manager::{ManagerError, ManagerHandle};
use crate::probe::PlatformInfo;

#[derive(Error, Debug, PartialEq)]
pub enum CommandSurfaceError {
    #[error("unknown command `{0}`")]
    UnknownCommand(String),

    #[error("`{0}` requires a process id")]
    MissingProcessId(&'static str),

    #[error("unknown config key `{0}`")]
    UnknownKey(String),
}

/// The closed command vocabulary accepted from the CLI transport.
#[derive(Clone, Debug, PartialEq)]
pub enum RemoteCommand {
    Status,
    List,
    Start(ProcessId),
    Stop(ProcessId),
    Restart(ProcessId),
    ConfigGet(String),
    ConfigList,
    ClusterInfo,
}

impl RemoteCommand {
    pub fn parse(tokens: &[String]) -> Result<Self, CommandSurfaceError> {
        let words: Vec<&str> = tokens.iter().map(String::as_str).collect();
        match words.as_slice() {
            ["status"] => Ok(RemoteCommand::Status),
            ["list"] => Ok(RemoteCommand::List),
            ["start", id] => parse_id(id, "start").map(RemoteCommand::Start),
            ["stop", id] => parse_id(id, "stop").map(RemoteCommand::Stop),
            ["restart", id] => parse_id(id, "restart").map(RemoteCommand::Restart),
            ["start"] => Err(CommandSurfaceError::MissingProcessId("start")),
            ["stop"] => Err(CommandSurfaceError::MissingProcessId("stop")),
            ["restart"] => Err(CommandSurfaceError::MissingProcessId("restart")),
            ["config", "get", key] => Ok(RemoteCommand::ConfigGet(key.to_string())),
            ["config", "list"] => Ok(RemoteCommand::ConfigList),
            ["cluster", "info"] => Ok(RemoteCommand::ClusterInfo),
            _ => Err(CommandSurfaceError::UnknownCommand(words.join(" "))),
        }
    }
}

fn parse_id(raw: &str, command: &'static str) -> Result<ProcessId, CommandSurfaceError> {
    ProcessId::try_from(raw.to_string())
        .map_err(|_| CommandSurfaceError::MissingProcessId(command))
}

/// Agent-level settings exposed through `config get` / `config list`.
#[derive(Clone, Debug)]
pub struct ConfigView {
    pub config_file: PathBuf,
    pub server: ServerConfig,
}

impl ConfigView {
    fn entries(&self) -> Vec<(&'static str, String)> {
        vec![
            ("config_file", self.config_file.display().to_string()),
            ("http_host", self.server.host.clone()),
            ("http_port", self.server.port.to_string()),
        ]
    }

    fn get(&self, key: &str) -> Option<String> {
        self.entries()
            .into_iter()
            .find(|(name, _)| *name == key)
            .map(|(_, value)| value)
    }
}

/// Result of one remote command: a JSON document plus the process exit code
/// the transport should propagate.
#[derive(Debug, PartialEq)]
pub struct CommandOutcome {
    pub exit_code: i32,
    pub output: Value,
}

impl CommandOutcome {
    fn ok(output: Value) -> Self {
        Self {
            exit_code: 0,
            output,
        }
    }

    fn error(message: String) -> Self {
        Self {
            exit_code: 1,
            output: json!({ "error": message }),
        }
    }
}

/// Maps the remote vocabulary 1:1 onto manager and config calls. Parsing and
/// JSON encoding happen here; the transport itself lives elsewhere.
pub struct CommandSurface {
    manager: ManagerHandle,
    config: ConfigView,
}

impl CommandSurface {
    pub fn new(manager: ManagerHandle, config: ConfigView) -> Self {
        Self { manager, config }
    }

    pub fn execute(&self, tokens: &[String]) -> CommandOutcome {
        match RemoteCommand::parse(tokens) {
            Ok(command) => {
                debug!(?command, "executing remote command");
                self.run(command)
            }
            Err(err) => CommandOutcome::error(err.to_string()),
        }
    }

    fn run(&self, command: RemoteCommand) -> CommandOutcome {
        match command {
            RemoteCommand::Status => self.with_summaries(|summaries| {
                json!({ "health": HealthSummary::aggregate(&summaries) })
            }),
            RemoteCommand::List => {
                self.with_summaries(|summaries| json!({ "processes": summaries }))
            }
            RemoteCommand::Start(id) => {
                self.lifecycle(&id, "started", ManagerHandle::start_process)
            }
            RemoteCommand::Stop(id) => self.lifecycle(&id, "stopped", ManagerHandle::stop_process),
            RemoteCommand::Restart(id) => {
                self.lifecycle(&id, "restarted", ManagerHandle::restart_process)
            }
            RemoteCommand::ConfigGet(key) => match self.config.get(&key) {
                Some(value) => CommandOutcome::ok(json!({ (key): value })),
                None => CommandOutcome::error(CommandSurfaceError::UnknownKey(key).to_string()),
            },
            RemoteCommand::ConfigList => {
                let entries: serde_json::Map<String, Value> = self
                    .config
                    .entries()
                    .into_iter()
                    .map(|(key, value)| (key.to_string(), Value::String(value)))
                    .collect();
                CommandOutcome::ok(json!({ "config": entries }))
            }
            RemoteCommand::ClusterInfo => self.with_summaries(|summaries| {
                json!({
                    "node": {
                        "platform": PlatformInfo::current(),
                        "http": {
                            "host": self.config.server.host.clone(),
                            "port": self.config.server.port,
                        },
                    },
                    "health": HealthSummary::aggregate(&summaries),
                })
            }),
        }
    }

    fn with_summaries(&self, encode: impl FnOnce(Vec<crate::manager::ProcessSummary>) -> Value) -> CommandOutcome {
        match self.manager.list_processes() {
            Ok(summaries) => CommandOutcome::ok(encode(summaries)),
            Err(err) => CommandOutcome::error(err.to_string()),
        }
    }

    fn lifecycle(
        &self,
        id: &ProcessId,
        verb: &'static str,
        action: fn(&ManagerHandle, &ProcessId) -> Result<(), ManagerError>,
    ) -> CommandOutcome {
        match action(&self.manager, id) {
            Ok(()) => CommandOutcome::ok(json!({ "status": verb, "id": id.to_string() })),
            Err(err) => CommandOutcome::error(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rstest::rstest;

    fn tokens(raw: &str) -> Vec<String> {
        raw.split_whitespace().map(str::to_string).collect()
    }

    #[rstest]
    #[case::status("status", RemoteCommand::Status)]
    #[case::list("list", RemoteCommand::List)]
    #[case::config_list("config list", RemoteCommand::ConfigList)]
    #[case::cluster_info("cluster info", RemoteCommand::ClusterInfo)]
    fn parse_bare_commands(#[case] raw: &str, #[case] expected: RemoteCommand) {
        assert_eq!(RemoteCommand::parse(&tokens(raw)).unwrap(), expected);
    }

    #[rstest]
    #[case::start("start worker")]
    #[case::stop("stop worker")]
    #[case::restart("restart worker")]
    fn parse_lifecycle_commands(#[case] raw: &str) {
        let command = RemoteCommand::parse(&tokens(raw)).unwrap();
        let id = match command {
            RemoteCommand::Start(id) | RemoteCommand::Stop(id) | RemoteCommand::Restart(id) => id,
            other => panic!("unexpected command {:?}", other),
        };
        assert_eq!(id.as_str(), "worker");
    }

    #[test]
    fn parse_config_get_keeps_the_key() {
        assert_eq!(
            RemoteCommand::parse(&tokens("config get http_port")).unwrap(),
            RemoteCommand::ConfigGet("http_port".to_string())
        );
    }

    #[rstest]
    #[case::empty("")]
    #[case::unknown("frobnicate")]
    #[case::excess_args("status now please")]
    #[case::bad_subcommand("cluster status")]
    fn parse_rejects_unknown_commands(#[case] raw: &str) {
        assert_matches!(
            RemoteCommand::parse(&tokens(raw)),
            Err(CommandSurfaceError::UnknownCommand(_))
        );
    }

    #[test]
    fn parse_rejects_missing_process_id() {
        assert_matches!(
            RemoteCommand::parse(&tokens("start")),
            Err(CommandSurfaceError::MissingProcessId("start"))
        );
    }

    #[cfg(target_family = "unix")]
    mod surface {
        use super::*;
        use crate::config::definition::tests::sleep_definition;
        use crate::event::channel::pub_sub;
        use crate::manager::Manager;
        use crate::ports::MockPortProbe;
        use crate::registry::Registry;
        use crate::supervisor::Supervisor;
        use std::sync::Arc;

        fn test_surface() -> CommandSurface {
            let (events_tx, _events_rx) = pub_sub();
            let (down_tx, down_rx) = pub_sub();
            let mut probe = MockPortProbe::new();
            probe.expect_ports_in_use().returning(|_| Vec::new());
            let supervisor = Arc::new(Supervisor::new(down_tx, Arc::new(probe)));
            let registry = Arc::new(Registry::new());
            let (manager, _thread) = Manager::spawn(
                vec![sleep_definition("worker")],
                supervisor,
                registry,
                events_tx,
                down_rx,
            );

            CommandSurface::new(
                manager,
                ConfigView {
                    config_file: PathBuf::from("/tmp/processes.json"),
                    server: ServerConfig::default(),
                },
            )
        }

        #[test]
        fn lifecycle_commands_round_trip() {
            let surface = test_surface();

            let started = surface.execute(&tokens("start worker"));
            assert_eq!(started.exit_code, 0);
            assert_eq!(started.output["status"], "started");

            let listed = surface.execute(&tokens("list"));
            assert_eq!(listed.exit_code, 0);
            assert_eq!(listed.output["processes"][0]["status"], "running");

            let stopped = surface.execute(&tokens("stop worker"));
            assert_eq!(stopped.exit_code, 0);
            assert_eq!(stopped.output["status"], "stopped");
        }

        #[test]
        fn failures_carry_exit_code_one() {
            let surface = test_surface();

            let unknown = surface.execute(&tokens("start ghost"));
            assert_eq!(unknown.exit_code, 1);
            assert!(unknown.output["error"].is_string());

            let gibberish = surface.execute(&tokens("frobnicate everything"));
            assert_eq!(gibberish.exit_code, 1);
        }

        #[test]
        fn config_vocabulary_reads_the_view() {
            let surface = test_surface();

            let port = surface.execute(&tokens("config get http_port"));
            assert_eq!(port.exit_code, 0);
            assert_eq!(port.output["http_port"], "4001");

            let listed = surface.execute(&tokens("config list"));
            assert_eq!(listed.exit_code, 0);
            assert_eq!(listed.output["config"]["config_file"], "/tmp/processes.json");

            let missing = surface.execute(&tokens("config get nope"));
            assert_eq!(missing.exit_code, 1);
        }

        #[test]
        fn cluster_info_reports_the_node() {
            let surface = test_surface();
            let info = surface.execute(&tokens("cluster info"));

            assert_eq!(info.exit_code, 0);
            assert!(info.output["node"]["platform"]["hostname"].is_string());
            assert_eq!(info.output["node"]["http"]["port"], 4001);
            assert_eq!(info.output["health"]["status"], "unhealthy");
        }
    }
}
