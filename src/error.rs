use crate::NUMBER_OF_USERS;

pub type Result<T> = std::result::Result<T, Error>;

/// The error type for protocol, transport, crypto and configuration
/// operations.
///
/// Timeouts are not errors: a read that sees no data within its window
/// yields [`crate::transport::ReadStatus::Zero`] and the caller decides
/// whether to retry.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The underlying read or write failed unrecoverably.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// A frame was malformed, or a reply did not contain any of the
    /// expected message kinds.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The backend answered with an ErrorResponse; carries the `M` and
    /// `C` (SQLSTATE) fields.
    #[error("backend error: {message} (SQLSTATE {code})")]
    Backend { message: String, code: String },

    /// Cipher initialization, processing or key derivation failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Authentication with the backend failed.
    #[error("authentication error: {0}")]
    Authentication(String),

    /// The server rejected the SSLRequest.
    #[error("server does not support TLS")]
    TlsUnsupported,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Error::Protocol(value)
    }
}

impl From<&str> for Error {
    fn from(value: &str) -> Self {
        Error::Protocol(value.to_string())
    }
}

/// Configuration failures, with the users-file statuses kept distinct so
/// callers can tell a missing master key from an oversized user table.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration or users file could not be opened or parsed.
    #[error("configuration not found or unreadable: {0}")]
    NotFound(String),

    /// A line of the file did not have the expected shape.
    #[error("could not parse configuration: {0}")]
    Parse(String),

    /// The master key is missing or invalid.
    #[error("invalid master key")]
    MasterKey,

    /// The users file defines more than the supported number of users.
    #[error("too many users defined: {0} (max {NUMBER_OF_USERS})")]
    TooManyUsers(usize),

    /// A loaded configuration failed validation.
    #[error("invalid configuration: {0}")]
    Validation(String),
}
