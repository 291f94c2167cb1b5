//! Error types for mailjudge

use thiserror::Error;

/// Main error type for mailjudge
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration error: account {account:?} has no {key:?} key")]
    ConfigReference { account: String, key: String },

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error(
        "You need to provide a password via the envar {envar:?} for the account {account:?}"
    )]
    MissingEnvPassword { account: String, envar: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Protocol error: connection lost: {0}")]
    Disconnected(String),

    #[error("Unknown action {0:?}")]
    InvalidAction(String),

    #[error("Action {0:?} requires a target folder")]
    MissingFolder(String),

    #[error("Predicate error: {0}")]
    Predicate(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for mailjudge
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::ConfigReference { .. } => "CONFIG_REFERENCE_ERROR",
            Error::Auth(_) => "AUTH_ERROR",
            Error::MissingEnvPassword { .. } => "AUTH_ERROR",
            Error::Protocol(_) => "PROTOCOL_ERROR",
            Error::Disconnected(_) => "PROTOCOL_ERROR",
            Error::InvalidAction(_) => "INVALID_ACTION",
            Error::MissingFolder(_) => "INVALID_ACTION",
            Error::Predicate(_) => "PREDICATE_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Io(_) => "PROTOCOL_ERROR",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether this is a credential problem
    pub fn is_auth(&self) -> bool {
        matches!(self, Error::Auth(_) | Error::MissingEnvPassword { .. })
    }

    /// Whether the mailbox session can no longer be used after this error.
    ///
    /// A command answered with `NO`/`BAD` leaves the session usable; a lost
    /// connection, a timeout or an I/O failure does not.
    pub fn ends_sweep(&self) -> bool {
        matches!(
            self,
            Error::Disconnected(_) | Error::Io(_) | Error::Auth(_) | Error::MissingEnvPassword { .. }
        )
    }

    /// Whether this error only aborts the current round
    pub fn aborts_round(&self) -> bool {
        matches!(self, Error::InvalidAction(_) | Error::MissingFolder(_))
    }
}
