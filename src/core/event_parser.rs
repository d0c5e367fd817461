//! JSON-filter event parsing
//!
//! Filter files are JSON documents declaring named regular expressions:
//!
//! ```json
//! {
//!   "filters": [
//!     {"name": "state", "regex_match": "power:(\\w+)"},
//!     {"name": "lost", "regex_match": "power lost"}
//!   ]
//! }
//! ```
//!
//! Each filter is labeled `<file stem>.<name>` (the file above saved as
//! `power.json` yields `power.state` and `power.lost`). Matching log lines
//! are appended to the event file as one JSON object per line, carrying the
//! capture groups per matched label plus the raw line and its timestamps.

use std::io::Write;
use std::path::Path;

use chrono::Local;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::core::log_filter::Parser;
use crate::core::log_writer::{HOST_TIMESTAMP_FORMAT, HOST_TIMESTAMP_LENGTH};
use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct FilterFile {
    filters: Vec<FilterEntry>,
}

#[derive(Debug, Deserialize)]
struct FilterEntry {
    name: String,
    regex_match: String,
}

struct EventFilter {
    label: String,
    regex: Regex,
}

/// Parser matching log lines against JSON-declared event filters.
#[derive(Default)]
pub struct EventFilterParser {
    filters: Vec<EventFilter>,
}

impl EventFilterParser {
    /// Creates a parser with no filters loaded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a parser preloaded from the given filter files.
    pub fn from_filter_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut parser = Self::new();
        for path in paths {
            parser.load_filter_file(path.as_ref())?;
        }
        Ok(parser)
    }

    /// Returns the labels of all loaded filters.
    pub fn event_labels(&self) -> Vec<String> {
        self.filters
            .iter()
            .map(|filter| filter.label.clone())
            .collect()
    }
}

impl Parser for EventFilterParser {
    fn load_filter_file(&mut self, path: &Path) -> Result<()> {
        let contents = std::fs::read_to_string(path)?;
        let file: FilterFile = serde_json::from_str(&contents).map_err(|err| {
            Error::ProtocolViolation(format!(
                "filter file {} is not valid filter JSON: {}",
                path.display(),
                err
            ))
        })?;
        let stem = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        for entry in file.filters {
            let regex = Regex::new(&entry.regex_match).map_err(|err| {
                Error::ProtocolViolation(format!(
                    "filter {} in {} has invalid regex {:?}: {}",
                    entry.name,
                    path.display(),
                    entry.regex_match,
                    err
                ))
            })?;
            let label = format!("{}.{}", stem, entry.name);
            debug!(%label, "loaded event filter");
            self.filters.push(EventFilter { label, regex });
        }
        Ok(())
    }

    fn process_line(
        &mut self,
        event_file: &mut dyn Write,
        raw_log_line: &str,
        header_length: usize,
        log_filename: &str,
    ) -> Result<()> {
        let mut event_data = Map::new();
        for filter in &self.filters {
            if let Some(caps) = filter.regex.captures(raw_log_line) {
                let groups: Vec<Value> = caps
                    .iter()
                    .skip(1)
                    .map(|group| match group {
                        Some(m) => json!(m.as_str()),
                        None => Value::Null,
                    })
                    .collect();
                event_data.insert(filter.label.clone(), json!(groups));
            }
        }
        if event_data.is_empty() {
            return Ok(());
        }

        let stripped = raw_log_line.trim_end();
        event_data.insert(
            "log_filename".to_string(),
            json!(log_filename),
        );
        event_data.insert(
            "raw_log_line".to_string(),
            json!(stripped.get(header_length.min(stripped.len())..).unwrap_or("")),
        );
        event_data.insert(
            "system_timestamp".to_string(),
            json!(raw_log_line
                .get(1..HOST_TIMESTAMP_LENGTH - 1)
                .unwrap_or("")),
        );
        event_data.insert(
            "matched_timestamp".to_string(),
            json!(Local::now().format(HOST_TIMESTAMP_FORMAT).to_string()),
        );

        let record = serde_json::to_string(&Value::Object(event_data))
            .map_err(|err| Error::ProtocolViolation(format!("event record: {}", err)))?;
        event_file.write_all(record.as_bytes())?;
        event_file.write_all(b"\n")?;
        event_file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::log_writer::add_log_header;
    use std::io::Write as _;

    fn write_filter_file(dir: &Path, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    const POWER_FILTERS: &str = r#"{
        "filters": [
            {"name": "state", "regex_match": "power:(\\w+)"},
            {"name": "lost", "regex_match": "power lost"}
        ]
    }"#;

    #[test]
    fn test_load_filter_file_labels() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_filter_file(dir.path(), "power.json", POWER_FILTERS);
        let parser = EventFilterParser::from_filter_files(&[path]).unwrap();
        assert_eq!(parser.event_labels(), vec!["power.state", "power.lost"]);
    }

    #[test]
    fn test_load_filter_file_rejects_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_filter_file(dir.path(), "bad.json", "not json at all");
        let mut parser = EventFilterParser::new();
        let err = parser.load_filter_file(&path).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }

    #[test]
    fn test_process_line_writes_matching_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_filter_file(dir.path(), "power.json", POWER_FILTERS);
        let mut parser = EventFilterParser::from_filter_files(&[path]).unwrap();

        let line = add_log_header("power:OFF\n", "0");
        let header_length = HOST_TIMESTAMP_LENGTH + 8;
        let mut out = Vec::new();
        parser
            .process_line(&mut out, &line, header_length, "device.txt")
            .unwrap();

        let record: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(record["power.state"], json!(["OFF"]));
        assert_eq!(record["raw_log_line"], json!("power:OFF"));
        assert_eq!(record["log_filename"], json!("device.txt"));
        assert_eq!(
            record["system_timestamp"].as_str().unwrap().len(),
            HOST_TIMESTAMP_LENGTH - 2
        );
    }

    #[test]
    fn test_process_line_skips_non_matching_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_filter_file(dir.path(), "power.json", POWER_FILTERS);
        let mut parser = EventFilterParser::from_filter_files(&[path]).unwrap();
        let mut out = Vec::new();
        parser
            .process_line(&mut out, "nothing interesting\n", 0, "device.txt")
            .unwrap();
        assert!(out.is_empty());
    }
}
