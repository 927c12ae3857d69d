pub mod child;
pub mod executable;
pub mod output;
pub mod terminator;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("executable `{0}` not found")]
    ExecutableNotFound(String),

    #[error("`{0}` not piped")]
    StreamPipeError(String),

    #[error("`{0}`")]
    IOError(#[from] std::io::Error),

    #[cfg(target_family = "unix")]
    #[error("signal error: `{0}`")]
    SignalError(String),
}
