//! # Switchboard
//!
//! A device-communication engine for embedded test devices:
//! - Serial and TCP transports, each owned by its own worker task
//! - Continuous line-framed logging with rotation and live log switching
//! - Event filtering of the log stream through JSON-declared regexes
//! - Expect APIs matching regexes over live device output
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use switchboard::{ExpectOptions, SendOptions, SerialConfig, SerialTransport, SwitchboardBuilder};
//!
//! #[tokio::main]
//! async fn main() -> switchboard::Result<()> {
//!     let config = SerialConfig::new("/dev/ttyUSB0", 115200);
//!     let switchboard = SwitchboardBuilder::new("lightbulb-1234", "logs/lightbulb-1234.txt")
//!         .transport(Box::new(SerialTransport::new(config)))
//!         .build()
//!         .await?;
//!
//!     let response = switchboard
//!         .send_and_expect(
//!             "version",
//!             &["version: (\\S+)".to_string()],
//!             &SendOptions::default(),
//!             &ExpectOptions::default().timeout(Duration::from_secs(10)),
//!         )
//!         .await?;
//!     println!("matched: {:?}", response.match_text);
//!
//!     switchboard.close().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod core;
pub mod error;

// Re-exports for convenience
pub use crate::core::button::Button;
pub use crate::core::event_parser::EventFilterParser;
pub use crate::core::expect::{ExpectMode, ExpectOptions, ExpectResponse};
pub use crate::core::framer::{DataFramer, InterwovenLogFramer, NewlineFramer};
pub use crate::core::identifier::{
    AllLogIdentifier, AllResponseIdentifier, AllUnknownIdentifier, LineIdentifier, LineType,
    MultiportIdentifier, PortLogIdentifier, RegexLogIdentifier, RegexResponseIdentifier,
};
pub use crate::core::log_filter::Parser;
pub use crate::core::switchboard::{SendOptions, Switchboard, SwitchboardBuilder};
pub use crate::core::transport::{
    MockTransport, SerialConfig, SerialTransport, TcpConfig, TcpTransport, Transport, TransportCall,
};
pub use crate::error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
