//! Error types for the BLE backend

use bleproxy_core::types::error_code;
use thiserror::Error;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors raised by the adapter and the connection machinery
#[derive(Error, Debug)]
pub enum BleError {
    #[error("BLE adapter not available: {0}")]
    AdapterUnavailable(String),

    #[error("Failed to connect to peripheral: {0}")]
    ConnectFailed(String),

    #[error("Connection attempt timed out")]
    ConnectTimeout,

    #[error("Peripheral not connected")]
    NotConnected,

    #[error("Peripheral not seen in any advertisement")]
    NotDiscovered,

    #[error("No attribute with handle {0}")]
    HandleNotFound(u16),

    #[error("GATT operation failed: {0}")]
    OperationFailed(String),

    #[error("Service discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("Notification subscription failed: {0}")]
    SubscriptionFailed(String),

    #[error("Pairing failed: {0}")]
    PairingFailed(String),

    #[error("Operation timed out")]
    OperationTimeout,

    #[error("Cache I/O failed: {0}")]
    Cache(#[from] std::io::Error),
}

impl BleError {
    /// Wire error code carried in the `error` field of BLE responses
    pub fn error_code(&self) -> u16 {
        match self {
            BleError::AdapterUnavailable(_) => error_code::ADAPTER_UNAVAILABLE,
            BleError::ConnectFailed(_) | BleError::NotDiscovered => error_code::FAILED,
            BleError::ConnectTimeout | BleError::OperationTimeout => error_code::TIMEOUT,
            BleError::NotConnected => error_code::NOT_CONNECTED,
            BleError::HandleNotFound(_) => error_code::HANDLE_NOT_FOUND,
            BleError::PairingFailed(_) => error_code::PAIRING_FAILED,
            BleError::Cache(_) => error_code::CACHE_CLEAR_FAILED,
            BleError::OperationFailed(_)
            | BleError::DiscoveryFailed(_)
            | BleError::SubscriptionFailed(_) => error_code::FAILED,
        }
    }
}
