use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur while talking to a wearable device
///
/// The type is `Clone` so the connectivity controller can retain the most
/// recent failure for display while also returning it to the caller.
#[derive(Error, Debug, Clone)]
pub enum WearableError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(Arc<btleplug::Error>),

    /// The host exposes no usable Bluetooth adapter
    #[error("Bluetooth transport is not available on this host")]
    TransportUnavailable,

    /// The user dismissed the device chooser, or nothing matched the filter
    #[error("No device selected")]
    NoDeviceSelected,

    /// The device id is unknown to the transport
    #[error("Device not found: {device_id}")]
    DeviceNotFound {
        /// Identifier that was looked up
        device_id: String,
    },

    /// The device lacks a service the session cannot work without
    #[error("Required service missing: {service}")]
    RequiredServiceMissing {
        /// Human-readable service name
        service: &'static str,
    },

    /// An optional service is absent; never surfaced from `connect`
    #[error("Optional service unavailable: {service}")]
    OptionalServiceUnavailable {
        /// Human-readable service name
        service: &'static str,
    },

    /// The hardware dropped the session without being asked to
    #[error("Session lost with device {device_id}")]
    SessionLost {
        /// Device whose session was lost
        device_id: String,
    },

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// An overlapping call of the same kind is still pending
    #[error("{operation} already in progress")]
    OperationInProgress {
        /// Name of the rejected operation
        operation: &'static str,
    },

    /// Another device already holds the single hardware session
    #[error("Device {device_id} is already connected")]
    SessionBusy {
        /// Device currently holding the session
        device_id: String,
    },

    /// The controller was torn down before the operation completed
    #[error("Controller was torn down before the operation completed")]
    Detached,

    /// Payload decoding failed
    #[error("Failed to parse payload: {0}")]
    ParseError(String),

    /// Other errors
    #[error("Other error: {0}")]
    Other(String),
}

impl From<btleplug::Error> for WearableError {
    fn from(error: btleplug::Error) -> Self {
        Self::Ble(Arc::new(error))
    }
}

/// Result type for wearable operations
pub type Result<T> = std::result::Result<T, WearableError>;

impl WearableError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectionFailed(_)
                | Self::SessionLost { .. }
                | Self::DeviceNotFound { .. }
                | Self::RequiredServiceMissing { .. }
        )
    }

    /// Check if the caller may simply try again
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NoDeviceSelected
                | Self::OperationInProgress { .. }
                | Self::SessionLost { .. }
                | Self::ConnectionFailed(_)
        )
    }

    /// Check if the user cancelled the device chooser
    #[must_use]
    pub const fn is_user_cancellation(&self) -> bool {
        matches!(self, Self::NoDeviceSelected)
    }
}
