use uuid::Uuid;

/// Transport-level failure reported by the radio stack.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("device not found")]
    NotFound,

    #[error("GATT operation failed with status {status}")]
    Gatt { status: String },

    #[error("transport error: {0}")]
    Transport(String),
}

/// Why a queued operation did not complete successfully.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    /// The link went down (or was torn down) while the operation was
    /// queued or in flight.
    #[error("link lost")]
    LinkLost,

    #[error("not connected")]
    NotConnected,

    #[error("connection attempt failed")]
    ConnectionFailed,

    #[error("already connected")]
    AlreadyConnected,

    #[error("characteristic {0} not found on device")]
    UnknownCharacteristic(Uuid),

    #[error("characteristic {characteristic} does not support {operation}")]
    Unsupported {
        characteristic: Uuid,
        operation: &'static str,
    },

    #[error(transparent)]
    Failed(#[from] ConnectionError),

    #[error("operation timed out")]
    TimedOut,
}
