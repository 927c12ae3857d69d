use std::collections::HashMap;
use std::io::Read;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::process::child::{ChildCommand, StartedChild};
use crate::process::executable::resolve_executable;

/// Environment keys whose values declare TCP ports the child intends to bind.
pub const PORT_ENV_KEYS: [&str; 5] = [
    "PORT",
    "HEALTH_PORT",
    "WEBSOCKET_PORT",
    "HTTP_PORT",
    "API_PORT",
];

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const PROBE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Extracts the declared ports from a definition's environment map.
/// Unparsable values are ignored; the child is the final authority anyway.
pub fn ports_from_env(env: &HashMap<String, String>) -> Vec<u16> {
    let mut ports: Vec<u16> = PORT_ENV_KEYS
        .iter()
        .filter_map(|key| env.get(*key))
        .filter_map(|value| value.trim().parse::<u16>().ok())
        .collect();
    ports.sort_unstable();
    ports.dedup();
    ports
}

/// Pre-start probe for ports already bound on the host. Advisory: a race
/// between probe and spawn is accepted.
#[cfg_attr(test, mockall::automock)]
pub trait PortProbe {
    /// Returns the subset of `ports` that currently have a listening socket.
    fn ports_in_use(&self, ports: &[u16]) -> Vec<u16>;
}

/// Probes listening sockets through the OS facility (`lsof` on POSIX,
/// `netstat` on Windows). A failing probe is treated as "all free" with a
/// warning, so a broken helper never blocks starts.
#[derive(Default)]
pub struct OsPortChecker;

impl PortProbe for OsPortChecker {
    fn ports_in_use(&self, ports: &[u16]) -> Vec<u16> {
        ports
            .iter()
            .copied()
            .filter(|port| port_is_listening(*port))
            .collect()
    }
}

#[cfg(target_family = "unix")]
fn port_is_listening(port: u16) -> bool {
    let args = vec![
        "-nP".to_string(),
        format!("-iTCP:{}", port),
        "-sTCP:LISTEN".to_string(),
        "-t".to_string(),
    ];
    match run_probe("lsof", &args) {
        Some(output) => !output.trim().is_empty(),
        None => false,
    }
}

#[cfg(target_family = "windows")]
fn port_is_listening(port: u16) -> bool {
    match run_probe("netstat", &["-ano".to_string()]) {
        Some(output) => output
            .lines()
            .filter(|line| line.contains("LISTENING"))
            .any(|line| line.contains(&format!(":{} ", port))),
        None => false,
    }
}

/// Runs a probe command under [`PROBE_TIMEOUT`] and returns its stdout.
/// `None` means the probe itself failed and callers must fail open.
fn run_probe(command: &str, args: &[String]) -> Option<String> {
    let program = match resolve_executable(command) {
        Ok(program) => program,
        Err(err) => {
            warn!(probe = command, "port probe unavailable, treating ports as free: {err}");
            return None;
        }
    };

    let mut child = match ChildCommand::new(&program, args).spawn() {
        Ok(child) => child,
        Err(err) => {
            warn!(probe = command, "port probe failed to start, treating ports as free: {err}");
            return None;
        }
    };

    if !wait_with_timeout(&mut child, PROBE_TIMEOUT) {
        warn!(probe = command, "port probe timed out, treating ports as free");
        let _ = child.kill();
        let _ = child.wait();
        return None;
    }

    let mut output = String::new();
    match child.take_stdout() {
        Ok(mut stdout) => {
            if stdout.read_to_string(&mut output).is_err() {
                return None;
            }
        }
        Err(_) => return None,
    }
    Some(output)
}

fn wait_with_timeout(child: &mut StartedChild, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        match child.try_status() {
            Ok(Some(_)) => return true,
            Ok(None) => std::thread::sleep(PROBE_POLL_INTERVAL),
            Err(_) => return false,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_are_extracted_from_known_keys_only() {
        let env = HashMap::from([
            ("PORT".to_string(), "3000".to_string()),
            ("HEALTH_PORT".to_string(), "3001".to_string()),
            ("SOME_OTHER_PORT".to_string(), "9000".to_string()),
            ("DEBUG".to_string(), "1".to_string()),
        ]);

        assert_eq!(ports_from_env(&env), vec![3000, 3001]);
    }

    #[test]
    fn unparsable_and_duplicate_ports_are_dropped() {
        let env = HashMap::from([
            ("PORT".to_string(), "3000".to_string()),
            ("HTTP_PORT".to_string(), "3000".to_string()),
            ("API_PORT".to_string(), "not-a-port".to_string()),
        ]);

        assert_eq!(ports_from_env(&env), vec![3000]);
    }

    #[test]
    fn empty_env_yields_no_ports() {
        assert!(ports_from_env(&HashMap::default()).is_empty());
    }

    #[cfg(target_family = "unix")]
    #[test]
    fn bound_port_is_reported_in_use() {
        // lsof may be missing on minimal hosts; the probe then fails open and
        // there is nothing to assert.
        if resolve_executable("lsof").is_err() {
            return;
        }

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let checker = OsPortChecker;
        assert_eq!(checker.ports_in_use(&[port]), vec![port]);

        drop(listener);
        assert!(checker.ports_in_use(&[port]).is_empty());
    }
}
