use std::time::Duration;

use thiserror::Error;

/// Failure modes of a provider round trip, as seen by the store and the UI.
#[derive(Debug, Error)]
pub enum Error {
    /// No transport exists in this execution context. Raised before anything is sent.
    #[error("no message channel available")]
    ChannelUnavailable,

    /// No matching reply arrived before the deadline.
    #[error("extension not responding ({request} gave no reply within {}ms)", .after.as_millis())]
    NotResponding { request: String, after: Duration },

    /// The provider answered with an explicit error payload.
    #[error("extension error: {0}")]
    Provider(String),

    /// The provider answered but advertises a different version than required.
    #[error("extension version {found} detected, expected {required}")]
    VersionMismatch { found: String, required: String },

    #[error("request payload for {0} is not a JSON object")]
    InvalidPayload(String),

    #[error("unexpected reply shape: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("channel rejected message: {0}")]
    Channel(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Coarse classification used to pick user-facing guidance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Provider missing: show install guidance.
    Unavailable,
    /// Provider present but outdated: show upgrade guidance.
    Incompatible,
    /// Provider refused the operation: offer a retry.
    Refused,
    Other,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ChannelUnavailable | Error::NotResponding { .. } => ErrorKind::Unavailable,
            Error::VersionMismatch { .. } => ErrorKind::Incompatible,
            Error::Provider(_) => ErrorKind::Refused,
            Error::InvalidPayload(_) | Error::Decode(_) | Error::Channel(_) | Error::InvalidConfig(_) => {
                ErrorKind::Other
            }
        }
    }

    pub fn is_timeout(&self) -> bool { matches!(self, Error::NotResponding { .. }) }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
