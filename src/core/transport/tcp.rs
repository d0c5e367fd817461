//! TCP transport implementation

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{properties, PropertyMap, Transport};
use crate::error::{Error, Result};

/// TCP connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    /// Remote host name or address
    pub host: String,
    /// Remote TCP port
    pub port: u16,
    /// Connect timeout in seconds
    pub connect_timeout_secs: u64,
    /// Reopen automatically after a read or write failure
    pub auto_reopen: bool,
    /// Open the connection when the worker starts
    pub open_on_start: bool,
}

impl TcpConfig {
    /// Create a new TCP configuration with default settings
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            connect_timeout_secs: 10,
            auto_reopen: false,
            open_on_start: true,
        }
    }

    /// Set connect timeout in seconds
    #[must_use]
    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    /// Enable automatic reopen after transport failures
    #[must_use]
    pub fn auto_reopen(mut self, enable: bool) -> Self {
        self.auto_reopen = enable;
        self
    }

    /// Open the connection when the worker starts
    #[must_use]
    pub fn open_on_start(mut self, enable: bool) -> Self {
        self.open_on_start = enable;
        self
    }
}

/// TCP transport
pub struct TcpTransport {
    config: TcpConfig,
    stream: Option<TcpStream>,
    props: PropertyMap,
}

impl TcpTransport {
    /// Create a new TCP transport (not yet connected)
    pub fn new(config: TcpConfig) -> Self {
        let mut props = PropertyMap::new();
        props.set(properties::AUTO_REOPEN, json!(config.auto_reopen));
        props.set(properties::OPEN_ON_START, json!(config.open_on_start));
        Self {
            config,
            stream: None,
            props,
        }
    }

    fn address(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let address = self.address();
        let connect_timeout = Duration::from_secs(self.config.connect_timeout_secs);
        let stream = timeout(connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| {
                Error::CommunicationTimeout(format!(
                    "connect to {} did not complete in {:?}",
                    address, connect_timeout
                ))
            })?
            .map_err(|err| {
                Error::TransportFailure(format!("unable to connect to {}: {}", address, err))
            })?;
        stream.set_nodelay(true).map_err(Error::Io)?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn read(&mut self, size: usize, read_timeout: Duration) -> Result<Bytes> {
        let address = self.address();
        let stream = self.stream.as_mut().ok_or_else(|| {
            Error::TransportFailure(format!("connection to {} is not open", address))
        })?;
        let mut buffer = vec![0u8; size];
        match timeout(read_timeout, stream.read(&mut buffer)).await {
            Err(_) => Ok(Bytes::new()),
            Ok(Ok(0)) => {
                // Remote closed the connection.
                self.stream = None;
                Err(Error::TransportFailure(format!(
                    "connection to {} closed by peer",
                    address
                )))
            }
            Ok(Ok(count)) => {
                buffer.truncate(count);
                Ok(Bytes::from(buffer))
            }
            Ok(Err(err)) => {
                self.stream = None;
                Err(Error::Io(err))
            }
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let address = self.address();
        let stream = self.stream.as_mut().ok_or_else(|| {
            Error::TransportFailure(format!("connection to {} is not open", address))
        })?;
        stream.write_all(data).await.map_err(Error::Io)?;
        stream.flush().await.map_err(Error::Io)?;
        Ok(data.len())
    }

    fn get_property(&self, key: &str) -> Option<Value> {
        self.props.get(key).cloned()
    }

    fn set_property(&mut self, key: &str, value: Value) -> Result<()> {
        self.props.set(key, value);
        Ok(())
    }
}
