//! Serial port transport implementation

use std::io::Read;
use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::warn;

use super::{properties, PropertyMap, Transport};
use crate::error::{Error, Result};

const XON: u8 = 0x11;
const XOFF: u8 = 0x13;
// Break byte for devices that treat Ctrl+C as break.
const BREAK_BYTE: u8 = 0x03;

// Some USB-serial adapters report readiness but deliver nothing; a
// close/reopen cycle clears the condition.
const EMPTY_READ_RETRIES: usize = 3;

/// Serial port flow control type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SerialFlowControl {
    /// No flow control
    #[default]
    None,
    /// Hardware flow control (RTS/CTS)
    Hardware,
    /// Software flow control (XON/XOFF)
    Software,
}

/// Serial port parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SerialParity {
    /// No parity
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// Serial port configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Port name (e.g., /dev/ttyUSB0)
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5, 6, 7, 8)
    pub data_bits: u8,
    /// Stop bits (1, 2)
    pub stop_bits: u8,
    /// Parity
    pub parity: SerialParity,
    /// Flow control
    pub flow_control: SerialFlowControl,
    /// Reopen automatically after a read or write failure
    pub auto_reopen: bool,
    /// Open the port when the worker starts
    pub open_on_start: bool,
}

impl SerialConfig {
    /// Create a new serial configuration with default settings
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
            flow_control: SerialFlowControl::None,
            auto_reopen: false,
            open_on_start: true,
        }
    }

    /// Set data bits
    #[must_use]
    pub fn data_bits(mut self, bits: u8) -> Self {
        self.data_bits = bits;
        self
    }

    /// Set stop bits
    #[must_use]
    pub fn stop_bits(mut self, bits: u8) -> Self {
        self.stop_bits = bits;
        self
    }

    /// Set parity
    #[must_use]
    pub fn parity(mut self, parity: SerialParity) -> Self {
        self.parity = parity;
        self
    }

    /// Set flow control
    #[must_use]
    pub fn flow_control(mut self, flow: SerialFlowControl) -> Self {
        self.flow_control = flow;
        self
    }

    /// Enable automatic reopen after transport failures
    #[must_use]
    pub fn auto_reopen(mut self, enable: bool) -> Self {
        self.auto_reopen = enable;
        self
    }

    /// Open the port when the worker starts
    #[must_use]
    pub fn open_on_start(mut self, enable: bool) -> Self {
        self.open_on_start = enable;
        self
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self::new("/dev/ttyUSB0", 115200)
    }
}

/// Serial port transport
pub struct SerialTransport {
    config: SerialConfig,
    port: Option<Box<dyn SerialPort>>,
    props: PropertyMap,
}

impl SerialTransport {
    /// Create a new serial transport (not yet open)
    pub fn new(config: SerialConfig) -> Self {
        let mut props = PropertyMap::new();
        props.set(properties::AUTO_REOPEN, json!(config.auto_reopen));
        props.set(properties::OPEN_ON_START, json!(config.open_on_start));
        props.set(properties::BAUDRATE, json!(config.baud_rate));
        Self {
            config,
            port: None,
            props,
        }
    }

    fn open_port(&self) -> Result<Box<dyn SerialPort>> {
        let data_bits = match self.config.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };
        let stop_bits = match self.config.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        };
        let parity = match self.config.parity {
            SerialParity::Odd => Parity::Odd,
            SerialParity::Even => Parity::Even,
            SerialParity::None => Parity::None,
        };
        let flow_control = match self.config.flow_control {
            SerialFlowControl::Hardware => FlowControl::Hardware,
            SerialFlowControl::Software => FlowControl::Software,
            SerialFlowControl::None => FlowControl::None,
        };
        let baud_rate = self
            .props
            .get(properties::BAUDRATE)
            .and_then(Value::as_u64)
            .map_or(self.config.baud_rate, |rate| rate as u32);

        serialport::new(&self.config.port, baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(flow_control)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|err| {
                Error::TransportFailure(format!(
                    "unable to open serial port {}: {}",
                    self.config.port, err
                ))
            })
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<usize> {
        let port = self.port.as_mut().ok_or_else(|| {
            Error::TransportFailure(format!("serial port {} is not open", self.config.port))
        })?;
        let written = port.write(data).map_err(Error::Io)?;
        port.flush().map_err(Error::Io)?;
        Ok(written)
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self) -> Result<()> {
        if self.port.is_none() {
            self.port = Some(self.open_port()?);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.port = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    async fn read(&mut self, size: usize, timeout: Duration) -> Result<Bytes> {
        for attempt in 0..EMPTY_READ_RETRIES {
            let port = self.port.as_mut().ok_or_else(|| {
                Error::TransportFailure(format!("serial port {} is not open", self.config.port))
            })?;
            port.set_timeout(timeout).map_err(|err| {
                Error::TransportFailure(format!("unable to set read timeout: {}", err))
            })?;

            let mut buffer = vec![0u8; size];
            match port.read(&mut buffer) {
                Ok(0) => {
                    // Readiness with no data; recycle the descriptor and retry.
                    warn!(
                        port = %self.config.port,
                        attempt,
                        "serial port returned no data while ready, reopening"
                    );
                    self.port = None;
                    self.port = Some(self.open_port()?);
                }
                Ok(count) => {
                    buffer.truncate(count);
                    return Ok(Bytes::from(buffer));
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::TimedOut => {
                    return Ok(Bytes::new());
                }
                Err(err) => return Err(Error::Io(err)),
            }
        }
        Err(Error::TransportFailure(format!(
            "serial port {} repeatedly returned no data while ready to read",
            self.config.port
        )))
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.write_bytes(data)
    }

    fn get_property(&self, key: &str) -> Option<Value> {
        self.props.get(key).cloned()
    }

    fn set_property(&mut self, key: &str, value: Value) -> Result<()> {
        if key == properties::BAUDRATE {
            let rate = value.as_u64().ok_or_else(|| {
                Error::InvalidArgument(format!("expected integer baudrate, found {}", value))
            })? as u32;
            if let Some(port) = self.port.as_mut() {
                port.set_baud_rate(rate).map_err(|err| {
                    Error::TransportFailure(format!("unable to set baudrate {}: {}", rate, err))
                })?;
            }
        }
        self.props.set(key, value);
        Ok(())
    }

    async fn flush_buffers(&mut self) -> Result<()> {
        let port = self.port.as_mut().ok_or_else(|| {
            Error::TransportFailure(format!("serial port {} is not open", self.config.port))
        })?;
        port.clear(ClearBuffer::All)
            .map_err(|err| Error::TransportFailure(format!("unable to flush buffers: {}", err)))
    }

    async fn send_xon(&mut self) -> Result<()> {
        self.write_bytes(&[XON]).map(|_| ())
    }

    async fn send_xoff(&mut self) -> Result<()> {
        self.write_bytes(&[XOFF]).map(|_| ())
    }

    async fn send_break(&mut self) -> Result<()> {
        self.write_bytes(&[BREAK_BYTE]).map(|_| ())
    }
}
