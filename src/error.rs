//! Error taxonomy.
//!
//! The data plane tolerates loss by design, so most failure conditions there
//! (duplicate id, exhausted energy, unknown task type, path loop) are silent
//! drops and never become `Error` values. Only control-plane failures reach
//! callers: transport problems on send, malformed datagrams, and invalid
//! configuration or parameters.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Local UDP resolve/send failure. Logged and recorded as telemetry;
    /// never propagated past the communication layer's caller.
    #[error("transport: {0}")]
    Transport(String),

    /// Malformed datagram or message payload. The datagram is dropped.
    #[error("decode: {0}")]
    Decode(String),

    /// Invalid parameter value or spatial configuration. Returned to the
    /// caller; fatal at startup.
    #[error("validation: {0}")]
    Validation(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Decode(e.to_string())
    }
}
