use std::path::PathBuf;

use clap::Parser;

/// Command line interface of the agent binary. Remote fleet commands travel
/// through the command surface, not through flags.
#[derive(Parser, Debug)]
#[command(name = "nurvus", version, about = "Per-node process supervision agent")]
pub struct Cli {
    /// Path of the process definition file. Falls back to NURVUS_CONFIG_FILE,
    /// then ~/.nurvus/processes.json.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Control API port. Falls back to NURVUS_PORT, then 4001.
    #[arg(long)]
    pub port: Option<u16>,
}

impl Cli {
    pub fn init() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_leave_overrides_empty() {
        let cli = Cli::parse_from(["nurvus"]);
        assert!(cli.config.is_none());
        assert!(cli.port.is_none());
    }

    #[test]
    fn flags_override_config_and_port() {
        let cli = Cli::parse_from(["nurvus", "--config", "/etc/nurvus.json", "--port", "4100"]);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/nurvus.json")));
        assert_eq!(cli.port, Some(4100));
    }
}
