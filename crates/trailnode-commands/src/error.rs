use thiserror::Error;

/// Errors raised by the command subsystem itself (store, resolver, executor).
#[derive(Debug, Error)]
pub enum CommandError {
    /// No handler is registered under the requested command name.
    #[error("No handler registered for command: {name}")]
    UnknownHandler { name: String },

    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A payload could not be packed or unpacked by its handler.
    #[error("Payload error: {0}")]
    Payload(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The command record cannot be persisted or scheduled as given.
    #[error("Invalid command: {0}")]
    Invalid(String),

    /// No command with the given ID exists in the store.
    #[error("Command not found: {id}")]
    NotFound { id: String },

    #[error("Command executor already initialised")]
    AlreadyInitialized,
}

pub type Result<T> = std::result::Result<T, CommandError>;

/// The error type returned by command handlers.
///
/// Its display string is what ends up in the command's `message` column when
/// the retry budget runs out.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Command(#[from] CommandError),

    /// Errors from collaborators (blockchain RPC, network, graph storage).
    #[error("{0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }

    pub fn other(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        HandlerError::Other(error.into())
    }
}

impl From<rusqlite::Error> for HandlerError {
    fn from(e: rusqlite::Error) -> Self {
        HandlerError::Command(CommandError::Database(e))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        HandlerError::Command(CommandError::Serialization(e))
    }
}

/// Reports pushed onto the executor's fault channel.
///
/// Only [`CommandFault::Internal`] is fatal: the executor stops dispatching
/// and the host is expected to exit and rely on replay after restart.
#[derive(Debug, Clone, Error)]
pub enum CommandFault {
    #[error("recover callback failed for {name} ({id}): {error}")]
    RecoverFailed {
        id: String,
        name: String,
        error: String,
    },

    #[error("expired callback failed for {name} ({id}): {error}")]
    ExpiredFailed {
        id: String,
        name: String,
        error: String,
    },

    #[error("executor fault while processing {name} ({id}): {error}")]
    Internal {
        id: String,
        name: String,
        error: String,
    },
}

impl CommandFault {
    pub fn is_fatal(&self) -> bool {
        matches!(self, CommandFault::Internal { .. })
    }
}
