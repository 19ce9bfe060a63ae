use thiserror::Error;

/// Errors that can occur when bridging ANT+ trainer traffic
#[derive(Error, Debug)]
pub enum BridgeError {
    /// USB transfer failed on the dongle endpoint
    #[error("USB transfer error: {0}")]
    Usb(#[from] nusb::transfer::TransferError),

    /// No usable ANT dongle was found during probing
    #[error("No ANT dongle found")]
    DongleNotFound,

    /// The dongle went away and could not be reconnected
    #[error("ANT dongle disconnected")]
    Disconnected,

    /// A frame or payload did not have the expected shape
    #[error("Framing error: {0}")]
    Frame(String),

    /// Operation timed out
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Protocol-level error (unexpected reply, bad startup probe, ...)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid parameters passed to an encoder or channel configuration
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// IO error (device enumeration, interface claiming)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Check if this error indicates the physical link is gone
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Usb(_) | Self::Disconnected | Self::DongleNotFound | Self::Io(_)
        )
    }

    /// Check if this error is recoverable without rebuilding the session
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Frame(_) | Self::InvalidParameters(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let gone = BridgeError::Disconnected;
        assert!(gone.is_connection_error());
        assert!(!gone.is_recoverable());

        let timeout = BridgeError::Timeout { timeout_ms: 20 };
        assert!(!timeout.is_connection_error());
        assert!(timeout.is_recoverable());

        let frame = BridgeError::Frame("short payload".to_string());
        assert!(frame.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let error = BridgeError::Protocol("no startup reply".to_string());
        let error_string = format!("{error}");
        assert!(error_string.contains("Protocol error"));
        assert!(error_string.contains("no startup reply"));
    }
}
