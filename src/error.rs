use thiserror::Error;

/// Snapshot load failed. The synchronizer stays re-initializable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchFailure {
    #[error("Request failed: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Server responded with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid response body: {0}")]
    Decode(String),

    #[error("Invalid base url: {0}")]
    InvalidUrl(String),
}

impl From<reqwest::Error> for FetchFailure {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

/// Push channel could not connect or was dropped. Non-fatal: the channel
/// reconnects on its own.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Server responded with status {0}")]
    Status(u16),

    #[error("Transport closed: {0}")]
    Closed(String),

    #[error("Malformed frame: {0}")]
    Frame(String),

    #[error("No transport available (tried: {0})")]
    Exhausted(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => Self::Status(status.as_u16()),
            None => Self::Connection(e.to_string()),
        }
    }
}

/// A required external credential or URL is missing or invalid.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("Failed to read config file: {0}")]
    Read(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),
}

/// A push payload that cannot be turned into a delta.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeltaError {
    #[error("Payload has no sensor id")]
    MissingId,

    #[error("Payload is not an object")]
    NotAnObject,

    #[error("Invalid sensor record: {0}")]
    InvalidRecord(String),
}

/// The sync hub could not be built, or is no longer running.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("Sync hub is not running")]
    Closed,

    #[error("Failed to build push transport: {0}")]
    Transport(#[from] TransportError),
}
