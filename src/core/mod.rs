//! Core module containing the device-communication engine
//!
//! This module provides:
//! - Transport layer for different connection types (Serial, TCP, mock)
//! - Transport worker tasks owning each transport exclusively
//! - Data framers splitting raw reads into lines
//! - Line identifiers classifying output per port
//! - Log writer with rotation and on-the-fly log switching
//! - Log filter tailing the log and recording events
//! - JSON-filter event parsing
//! - Expect engine matching regexes over live output
//! - Switchboard orchestration tying it all together
//! - Button capability boundary for devices with actuatable buttons

pub mod button;
pub mod event_parser;
pub mod expect;
pub mod framer;
pub mod identifier;
pub mod log_filter;
pub mod log_writer;
pub mod switchboard;
pub mod transport;
pub mod worker;
