pub mod definition;
pub mod loader;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read process definition file `{path}`: {source}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid process definition file: {0}")]
    InvalidFormat(#[from] serde_json::Error),

    #[error("duplicate process id `{0}`")]
    DuplicateId(String),

    #[error("invalid definition for `{id}`: {reason}")]
    InvalidDefinition { id: String, reason: String },
}
