use thiserror::Error;

/// Core error type for the Workcell runtime
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Controller link is down; nothing is queued while disconnected
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// An operation did not finish within its deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A signal write did not read back as the value written
    #[error("Signal write verification failed on {signal}: wrote {expected}, read back {actual}")]
    SignalWriteVerificationFailed {
        /// Signal name the write targeted
        signal: String,
        /// Value written
        expected: String,
        /// Value read back
        actual: String,
    },

    /// Signal name missing from the catalog
    #[error("Unknown signal: {0}")]
    UnknownSignal(String),

    /// Unit is mid-transition and cannot accept another command
    #[error("Busy: {0}")]
    Busy(String),

    /// Requested action is not legal from the current state
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Interlock policy refused the command
    #[error("Interlock denied: {0}")]
    InterlockDenied(String),

    /// Device is already claimed by another flow
    #[error("Device busy: {0}")]
    DeviceBusy(String),

    /// Flow instance not found
    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    /// Flow is waiting on an operator confirmation
    #[error("Confirmation required: {0}")]
    ConfirmationRequired(String),

    /// Recovery mode not recognized
    #[error("Invalid recovery mode: {0}")]
    InvalidRecoveryMode(String),

    /// Remote dosing platform reported a non-success code
    #[error("Remote task error: code {0}")]
    RemoteTaskError(i64),

    /// State store error
    #[error("State store error: {0}")]
    StateStoreError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Input/output error
    #[error("Input/output error: {0}")]
    IOError(String),

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::IOError(err.to_string())
    }
}

impl From<String> for CoreError {
    fn from(err: String) -> Self {
        CoreError::Other(err)
    }
}

impl From<&str> for CoreError {
    fn from(err: &str) -> Self {
        CoreError::Other(err.to_string())
    }
}
