//! Core protocol types for the bleproxy daemon
//!
//! This crate contains everything both sides of the daemon agree on:
//!
//! - [`frame`] - Length-delimited plaintext framing over TCP
//! - [`proto`] - The protobuf-subset field codec used by every message
//! - [`message`] - The ESPHome native-API message catalogue
//! - [`types`] - Peripheral addresses, advertisements, and the GATT tree
//! - [`config`] - Daemon configuration and timeout table
//! - [`error`] - Shared error taxonomy

pub mod config;
pub mod error;
pub mod frame;
pub mod message;
pub mod proto;
pub mod types;

pub use config::{ProxyConfig, Timeouts};
pub use error::{FrameError, ProxyError};
pub use frame::{Frame, FrameDecoder};
pub use message::{ClientMessage, MessageType, ServerMessage};
pub use types::{AddressType, Advertisement, DeviceAddress, ScannerMode, ScannerState, SessionId};

/// Convenience result alias used throughout the workspace
pub type Result<T> = core::result::Result<T, ProxyError>;
