use std::fmt::{Display, Formatter};

use tracing::warn;

pub const PORT_ENV: &str = "NURVUS_PORT";
const DEFAULT_PORT: u16 = 4001;
const DEFAULT_HOST: &str = "0.0.0.0";
pub(super) const DEFAULT_WORKERS: usize = 2;

#[derive(PartialEq, Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl ServerConfig {
    /// Resolution order for the bind port: CLI flag, `NURVUS_PORT`, default.
    /// An unparsable env value falls back to the default with a warning.
    pub fn from_env(cli_port: Option<u16>) -> Self {
        let port = cli_port.unwrap_or_else(|| match std::env::var(PORT_ENV) {
            Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warn!(value = raw, "unparsable {PORT_ENV}, using default port");
                DEFAULT_PORT
            }),
            Err(_) => DEFAULT_PORT,
        });
        Self {
            host: DEFAULT_HOST.to_string(),
            port,
        }
    }
}

impl Display for ServerConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn cli_flag_wins_over_env() {
        std::env::set_var(PORT_ENV, "5000");
        assert_eq!(ServerConfig::from_env(Some(6000)).port, 6000);
        std::env::remove_var(PORT_ENV);
    }

    #[test]
    #[serial]
    fn env_wins_over_default() {
        std::env::set_var(PORT_ENV, "5000");
        assert_eq!(ServerConfig::from_env(None).port, 5000);
        std::env::remove_var(PORT_ENV);
    }

    #[test]
    #[serial]
    fn unparsable_env_falls_back_to_default() {
        std::env::set_var(PORT_ENV, "not-a-port");
        assert_eq!(ServerConfig::from_env(None).port, 4001);
        std::env::remove_var(PORT_ENV);
    }

    #[test]
    #[serial]
    fn default_binds_all_interfaces_on_4001() {
        std::env::remove_var(PORT_ENV);
        let config = ServerConfig::from_env(None);
        assert_eq!(config.to_string(), "0.0.0.0:4001");
    }
}
