use thiserror::Error;
use tracing::metadata::LevelFilter;
use tracing_subscriber::fmt::format::PrettyFields;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

/// Env var holding the tracing filter directive (e.g. `nurvus=debug`).
pub const LOG_FILTER_ENV: &str = "NURVUS_LOG";

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("init logging error: `{0}`")]
    TryInitError(String),
}

/// Global logging configuration for the agent binary.
#[derive(Debug, Default, Clone)]
pub struct LoggingConfig {
    /// Include the event target in the formatted output.
    pub target: bool,
}

impl LoggingConfig {
    /// Installs the global tracing subscriber: INFO by default, overridable
    /// through [`LOG_FILTER_ENV`], local timestamps.
    pub fn try_init(self) -> Result<(), LoggingError> {
        tracing_subscriber::fmt()
            .with_target(self.target)
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .with_env_var(LOG_FILTER_ENV)
                    .from_env_lossy(),
            )
            .with_timer(ChronoLocal::new("%Y-%m-%dT%H:%M:%S%.3f".to_string()))
            .fmt_fields(PrettyFields::new())
            .try_init()
            .map_err(|_| {
                LoggingError::TryInitError("unable to set the global logging subscriber".to_string())
            })
    }
}
