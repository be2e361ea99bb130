use thiserror::Error;

use crate::abi::ReturnCode;

/// Errors raised on either side of the plugin boundary.
///
/// None of these are ever unwound across an `extern "C"` entry point; they are
/// turned into a [`ReturnCode`] and, where useful, recorded as the instance's
/// last error string.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Malformed init/open parameters.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Field kind or extraction not implemented by the plugin.
    #[error("not supported: {0}")]
    Unsupported(String),

    /// A native buffer could not be allocated.
    #[error("native allocation of {size} bytes failed")]
    Allocation { size: usize },

    /// An operation was invoked on a null, foreign or busy handle.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// The event stream is exhausted.
    #[error("end of event stream")]
    Eof,

    /// No event was available in time; the host may retry.
    #[error("timed out waiting for the next event")]
    Timeout,

    #[error(transparent)]
    Plugin(#[from] anyhow::Error),
}

impl BridgeError {
    /// Code reported to the host for this error.
    pub fn return_code(&self) -> ReturnCode {
        match self {
            Self::Unsupported(_) => ReturnCode::NotSupported,
            Self::Eof => ReturnCode::Eof,
            Self::Timeout => ReturnCode::Timeout,
            Self::Configuration(_)
            | Self::Allocation { .. }
            | Self::ProtocolViolation(_)
            | Self::Plugin(_) => ReturnCode::Failure,
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
