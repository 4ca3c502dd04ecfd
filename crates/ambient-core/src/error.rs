//! Error types shared across the control plane

use thiserror::Error;

/// Errors talking to the Ambient API server.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("API returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("API transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("failed to decode API payload: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Errors talking to the cluster API.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("cluster API returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("cluster transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("failed to decode cluster payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("cluster client setup failed: {0}")]
    Setup(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }
}

/// Permanent input problems. Events failing with these are dropped, not retried.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{field} {value:?} is not a valid DNS label")]
    InvalidDnsLabel { field: &'static str, value: String },
    #[error("{field} {value:?} is not a valid resource name")]
    InvalidName { field: &'static str, value: String },
    #[error("role binding {name:?} would serve both {first} and {second}")]
    BindingNameCollision {
        name: String,
        first: String,
        second: String,
    },
    #[error("malformed {field} JSON: {source}")]
    MalformedJson {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Process supervision failures.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("session limit reached ({max} concurrent sessions)")]
    LimitReached { max: usize },
    #[error("no free port in range {start}-{end}")]
    PortPoolExhausted { start: u16, end: u16 },
    #[error("session id {0:?} cannot be used as a directory name")]
    InvalidSessionId(String),
    #[error("runner command is empty")]
    EmptyCommand,
    #[error("runner command could not be parsed: {0}")]
    InvalidCommand(String),
    #[error("failed to spawn runner {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Configuration loading and validation failures. Always fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
