//! Server errors and process exit status

use std::net::SocketAddr;
use std::process::ExitCode;

use bayes_engine::StoreError;

use crate::config::ServerConfigError;

/// Errors that stop the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Configuration invalid
    #[error("invalid configuration: {0}")]
    Config(#[from] ServerConfigError),

    /// The listen socket could not be bound
    #[error("cannot listen on {addr}: {source}")]
    Bind {
        /// Address requested
        addr: SocketAddr,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Poll, signal or thread setup failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The store failed; binlog errors are never retried
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How the process ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Clean shutdown
    Clean,
    /// Runtime failure, or a second termination signal
    Failure,
    /// Bad usage, or a damaged binlog that could not be truncated
    Usage,
    /// The listen socket could not be bound
    Bind,
}

impl ExitStatus {
    /// Numeric status.
    pub fn code(self) -> u8 {
        match self {
            ExitStatus::Clean => 0,
            ExitStatus::Failure => 1,
            ExitStatus::Usage => 2,
            ExitStatus::Bind => 3,
        }
    }
}

impl From<ExitStatus> for ExitCode {
    fn from(status: ExitStatus) -> Self {
        ExitCode::from(status.code())
    }
}

impl ServerError {
    /// Exit status this error ends the process with.
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            ServerError::Bind { .. } => ExitStatus::Bind,
            ServerError::Config(_) => ExitStatus::Usage,
            ServerError::Store(e) if e.is_truncate_failure() => ExitStatus::Usage,
            _ => ExitStatus::Failure,
        }
    }
}
