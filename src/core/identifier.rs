//! Classification of device output lines as log, response, or unknown
//!
//! Identifiers answer one question: should this line be accepted for the
//! line type a caller asked for? [`AllUnknownIdentifier`] (the default)
//! accepts every line for every requested type.

use regex::Regex;

use crate::error::{Error, Result};

/// The category of device output a caller is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineType {
    /// Accept both log and response lines
    #[default]
    All,
    /// Device log output
    Log,
    /// Command response output
    Response,
}

/// Identifies device output lines as log, response, or unknown.
pub trait LineIdentifier: Send + Sync {
    /// Returns true if `line` from transport `port` should be accepted for
    /// the requested `line_type`.
    fn accept(&self, port: usize, line: &str, line_type: LineType) -> bool;
}

/// Identifies all output from all ports as log lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllLogIdentifier;

impl LineIdentifier for AllLogIdentifier {
    fn accept(&self, _port: usize, _line: &str, line_type: LineType) -> bool {
        matches!(line_type, LineType::All | LineType::Log)
    }
}

/// Identifies all output from all ports as response lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllResponseIdentifier;

impl LineIdentifier for AllResponseIdentifier {
    fn accept(&self, _port: usize, _line: &str, line_type: LineType) -> bool {
        matches!(line_type, LineType::All | LineType::Response)
    }
}

/// Identifies all output as unknown and accepts it for every line type.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllUnknownIdentifier;

impl LineIdentifier for AllUnknownIdentifier {
    fn accept(&self, _port: usize, _line: &str, _line_type: LineType) -> bool {
        true
    }
}

/// Identifies all output from the listed ports as logs.
///
/// Output from every other port is considered a response.
#[derive(Debug, Clone)]
pub struct PortLogIdentifier {
    log_ports: Vec<usize>,
}

impl PortLogIdentifier {
    /// Treats lines from `log_ports` as logs; an empty list defaults to port 1.
    pub fn new(log_ports: Vec<usize>) -> Self {
        let log_ports = if log_ports.is_empty() {
            vec![1]
        } else {
            log_ports
        };
        Self { log_ports }
    }
}

impl Default for PortLogIdentifier {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl LineIdentifier for PortLogIdentifier {
    fn accept(&self, port: usize, _line: &str, line_type: LineType) -> bool {
        if self.log_ports.contains(&port) {
            matches!(line_type, LineType::All | LineType::Log)
        } else {
            matches!(line_type, LineType::All | LineType::Response)
        }
    }
}

/// Classifies lines matching a pattern as one type; non-matches are unknown.
#[derive(Debug, Clone)]
struct RegexIdentifier {
    pattern: Regex,
    match_type: LineType,
    use_match: bool,
}

impl RegexIdentifier {
    fn new(pattern: &str, match_type: LineType, use_match: bool) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|err| Error::InvalidArgument(format!("invalid identifier pattern: {}", err)))?;
        Ok(Self {
            pattern,
            match_type,
            use_match,
        })
    }

    fn accept(&self, line: &str, line_type: LineType) -> bool {
        let is_type = if self.use_match {
            // Anchored at the start of the line.
            self.pattern.find(line).is_some_and(|m| m.start() == 0)
        } else {
            self.pattern.is_match(line)
        };
        if line_type == LineType::All {
            return true;
        }
        if line_type == self.match_type && !is_type {
            return false;
        }
        if line_type != self.match_type && is_type {
            return false;
        }
        true
    }
}

/// Identifies output matching a pattern as logs; everything else is unknown.
#[derive(Debug, Clone)]
pub struct RegexLogIdentifier {
    inner: RegexIdentifier,
}

impl RegexLogIdentifier {
    /// Creates an identifier from `log_pattern`. With `use_match` the
    /// pattern must match at the beginning of the line.
    pub fn new(log_pattern: &str, use_match: bool) -> Result<Self> {
        Ok(Self {
            inner: RegexIdentifier::new(log_pattern, LineType::Log, use_match)?,
        })
    }
}

impl LineIdentifier for RegexLogIdentifier {
    fn accept(&self, _port: usize, line: &str, line_type: LineType) -> bool {
        self.inner.accept(line, line_type)
    }
}

/// Identifies output matching a pattern as responses; everything else is unknown.
#[derive(Debug, Clone)]
pub struct RegexResponseIdentifier {
    inner: RegexIdentifier,
}

impl RegexResponseIdentifier {
    /// Creates an identifier from `response_pattern`. With `use_match` the
    /// pattern must match at the beginning of the line.
    pub fn new(response_pattern: &str, use_match: bool) -> Result<Self> {
        Ok(Self {
            inner: RegexIdentifier::new(response_pattern, LineType::Response, use_match)?,
        })
    }
}

impl LineIdentifier for RegexResponseIdentifier {
    fn accept(&self, _port: usize, line: &str, line_type: LineType) -> bool {
        self.inner.accept(line, line_type)
    }
}

/// Delegates identification to a per-port identifier.
///
/// Lines from ports without an identifier are accepted unconditionally.
pub struct MultiportIdentifier {
    identifiers: Vec<Box<dyn LineIdentifier>>,
}

impl MultiportIdentifier {
    /// Creates an identifier that delegates to `identifiers[port]`.
    pub fn new(identifiers: Vec<Box<dyn LineIdentifier>>) -> Self {
        Self { identifiers }
    }
}

impl LineIdentifier for MultiportIdentifier {
    fn accept(&self, port: usize, line: &str, line_type: LineType) -> bool {
        match self.identifiers.get(port) {
            Some(identifier) => identifier.accept(port, line, line_type),
            None => true,
        }
    }
}
