use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that may occur in this library.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum Error {
    /// A connection was requested while the session was not disconnected.
    #[error("The session is busy, disconnect before connecting again")]
    AlreadyBusy,

    /// The port could not be opened,
    /// e.g. it does not exist, permissions are wrong, or the baud rate is unusable.
    #[error("Could not open port: {0}")]
    TransportOpen(String),

    /// Reading from (or writing to) an open port failed.
    #[error("Port I/O failed: {0}")]
    TransportRead(String),

    /// Releasing the port failed.
    /// The port is considered closed regardless.
    #[error("Could not close port cleanly: {0}")]
    TransportClose(String),

    /// Listing devices failed.
    #[error("Could not list devices: {0}")]
    Enumeration(String),

    /// The request needs a connected session.
    #[error("No device is connected")]
    NotConnected,

    /// A configuration (or rule set) did not pass validation.
    #[error("Bad configuration: {0}")]
    BadConfig(String),

    /// Bad json.
    #[error("The request `{request}` could not be deserialized. Problem: {problem}")]
    BadJson {
        /// The problematic request.
        request: String,

        /// The deserialization issue.
        problem: String,
    },

    /// The user did something which is not valid.
    /// For example, subscribe to the same feed twice.
    #[error("The request did not conform to valid usage. Problem: `{0}`")]
    BadUsage(String),

    /// Something went wrong inside the server.
    #[error("Internal issue: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the reason if this is [`Error::BadConfig`].
    pub fn try_into_bad_config(self) -> Result<String, Self> {
        if let Self::BadConfig(v) = self {
            Ok(v)
        } else {
            Err(self)
        }
    }
}
