use std::{error, fmt};

// -------------------------------------------------------------------------------------------------

/// `Error` provides an enumeration of all possible errors reported by grainflow.
///
/// Per-block processing errors are never raised: the realtime render path recovers locally by
/// clamping or substituting values. Errors here are reported to the control thread only.
#[derive(Debug)]
pub enum Error {
    /// Invalid engine construction config. Fatal: the engine refuses to start.
    ConfigError(String),
    /// Invalid message field or parameter value sent from the control thread.
    ParameterError(String),
    /// The engine's message inbox is full and the message was not delivered.
    SendError,
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigError(str) => write!(f, "Invalid engine config: {str}"),
            Self::ParameterError(str) => write!(f, "Invalid parameter: {str}"),
            Self::SendError => write!(f, "Failed to send into the engine's message queue"),
        }
    }
}
