use std::io;

use thiserror::Error;

/// Errors from the wire codecs.
#[derive(Debug, Error)]
pub enum SerialPortError {
    /// IO related errors.
    #[error("Underlying IO problem: {0}")]
    IO(#[from] io::Error),
}
