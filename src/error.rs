use thiserror::Error;

/// Result type for Triad AMS operations
pub type Result<T> = std::result::Result<T, AmsError>;

/// Errors that can occur when talking to a Triad AMS switch
#[derive(Error, Debug)]
pub enum AmsError {
    /// The TCP connection could not be opened
    #[error("Failed to connect to {address}: {source}")]
    Connection {
        /// `host:port` that was dialled
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// The device answered with an empty frame, `command error`, or a frame
    /// that does not belong to the command that was sent
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No response frame arrived before the read deadline
    #[error("Request timeout")]
    Timeout,

    /// The stream ended before a frame terminator was read
    #[error("Connection closed mid-frame")]
    IncompleteRead,

    /// The command was dropped from the queue during shutdown
    #[error("Command cancelled")]
    Cancelled,

    /// I/O error on an open connection
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A channel number outside what the device accepts
    #[error("Invalid channel: {0}")]
    InvalidChannel(String),

    /// A raw command that could not be built
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// A volume step outside 1..=100
    #[error("Volume step {0} out of range 1..=100")]
    StepOutOfRange(i64),

    /// A well-framed response that could not be parsed
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Rejected configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AmsError {
    /// Whether this failure means the connection can no longer be trusted.
    ///
    /// The dispatcher drops and reopens the socket for these; everything else
    /// is reported to the caller and leaves the connection alone.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            AmsError::Connection { .. }
                | AmsError::Protocol(_)
                | AmsError::Timeout
                | AmsError::IncompleteRead
                | AmsError::Cancelled
                | AmsError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(AmsError::Timeout.is_transport());
        assert!(AmsError::IncompleteRead.is_transport());
        assert!(AmsError::Protocol("command error".into()).is_transport());
        assert!(AmsError::Cancelled.is_transport());
        assert!(AmsError::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe)).is_transport());

        assert!(!AmsError::InvalidChannel("output 0".into()).is_transport());
        assert!(!AmsError::InvalidResponse("Volume : ?".into()).is_transport());
        assert!(!AmsError::StepOutOfRange(0).is_transport());
    }

    #[test]
    fn test_connection_error_names_address() {
        let err = AmsError::Connection {
            address: "10.0.0.5:52000".into(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        assert!(err.to_string().contains("10.0.0.5:52000"));
    }
}
