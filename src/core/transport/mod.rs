//! Transport layer for device connections
//!
//! Supports:
//! - Serial ports (RS-232, USB-Serial)
//! - Raw TCP connections
//! - Scripted in-memory transports for tests
//!
//! A transport is owned exclusively by one worker task, so implementations
//! need no internal locking.

mod mock;
mod serial;
mod tcp;

pub use mock::MockTransport;
pub use serial::{SerialConfig, SerialFlowControl, SerialParity, SerialTransport};
pub use tcp::{TcpConfig, TcpTransport};

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use crate::error::{Error, Result};

/// Well-known transport property keys.
pub mod properties {
    /// Reopen the transport automatically after a read or write failure
    pub const AUTO_REOPEN: &str = "auto_reopen";
    /// Open the transport when its worker starts
    pub const OPEN_ON_START: &str = "open_on_start";
    /// Serial baud rate
    pub const BAUDRATE: &str = "baudrate";
}

/// String-keyed dynamic properties carried by every transport.
#[derive(Debug, Clone, Default)]
pub struct PropertyMap {
    values: HashMap<String, Value>,
}

impl PropertyMap {
    /// Creates an empty property map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the property value for `key`, if set.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Sets the property `key` to `value`.
    pub fn set(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }

    /// Returns the property for `key` as a bool, or `default` when unset or
    /// not a bool.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.values
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(default)
    }
}

/// A device connection usable by a transport worker.
#[async_trait]
pub trait Transport: Send {
    /// Opens the connection.
    async fn open(&mut self) -> Result<()>;

    /// Closes the connection. Closing a closed transport is a no-op.
    async fn close(&mut self) -> Result<()>;

    /// Returns true if the connection is open.
    fn is_open(&self) -> bool;

    /// Reads up to `size` bytes, waiting at most `timeout`.
    ///
    /// Returns an empty buffer when no data arrived before the timeout.
    async fn read(&mut self, size: usize, timeout: Duration) -> Result<Bytes>;

    /// Writes `data` and returns the number of bytes written.
    async fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Returns the property value for `key`, if set.
    fn get_property(&self, key: &str) -> Option<Value>;

    /// Sets the property `key` to `value`, applying it to the open
    /// connection where the transport supports live changes.
    fn set_property(&mut self, key: &str, value: Value) -> Result<()>;

    /// Discards unread input and unsent output.
    async fn flush_buffers(&mut self) -> Result<()> {
        Err(Error::TransportFailure(
            "flush_buffers is not supported by this transport".to_string(),
        ))
    }

    /// Sends the XON flow control character.
    async fn send_xon(&mut self) -> Result<()> {
        Err(Error::TransportFailure(
            "send_xon is not supported by this transport".to_string(),
        ))
    }

    /// Sends the XOFF flow control character.
    async fn send_xoff(&mut self) -> Result<()> {
        Err(Error::TransportFailure(
            "send_xoff is not supported by this transport".to_string(),
        ))
    }

    /// Sends the break control character.
    async fn send_break(&mut self) -> Result<()> {
        Err(Error::TransportFailure(
            "send_break is not supported by this transport".to_string(),
        ))
    }
}

/// An out-of-band operation executed by a worker on its transport.
///
/// Unsupported calls produce an error result on the call channel rather
/// than a worker fault.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    /// Discard unread input and unsent output
    FlushBuffers,
    /// Send the XON flow control character
    SendXon,
    /// Send the XOFF flow control character
    SendXoff,
    /// Send the break control character
    SendBreak,
    /// Set a transport property
    SetProperty {
        /// Property key to set
        key: String,
        /// New property value
        value: Value,
    },
    /// Read a transport property
    GetProperty {
        /// Property key to read
        key: String,
    },
}

impl fmt::Display for TransportCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FlushBuffers => write!(f, "flush_buffers"),
            Self::SendXon => write!(f, "send_xon"),
            Self::SendXoff => write!(f, "send_xoff"),
            Self::SendBreak => write!(f, "send_break"),
            Self::SetProperty { key, value } => write!(f, "set_property {}={}", key, value),
            Self::GetProperty { key } => write!(f, "get_property {}", key),
        }
    }
}
