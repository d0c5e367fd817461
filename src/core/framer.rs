//! Framing of raw transport data into partial and complete lines
//!
//! [`NewlineFramer`] (the default) splits raw data at newline characters.
//! [`InterwovenLogFramer`] additionally extracts log lines that a device
//! interleaves into command responses, using a caller-provided regex with a
//! single capture group.
//!
//! A complete line always carries its trailing newline; whatever remains
//! without one is a partial line and is returned last.

use std::borrow::Cow;

use regex::Regex;

use crate::error::{Error, Result};

/// Transforms raw device output into discrete lines.
pub trait DataFramer: Send {
    /// Splits `raw_data` into framed lines.
    ///
    /// `begin` skips characters known not to contain a newline (the length
    /// of a previously buffered partial line); the first returned line still
    /// starts at the beginning of `raw_data`. `end` bounds the newline
    /// search; characters past it are returned unsplit in the final line.
    fn get_lines(&self, raw_data: &str, begin: usize, end: Option<usize>) -> Result<Vec<String>>;
}

fn validate_range(data: &str, begin: usize, end: Option<usize>) -> Result<usize> {
    let len = data.len();
    if begin > len || !data.is_char_boundary(begin) {
        return Err(Error::InvalidArgument(format!(
            "expected begin to be a char boundary in 0..={}, found {}",
            len, begin
        )));
    }
    let end = end.unwrap_or(len);
    if end > len || !data.is_char_boundary(end) {
        return Err(Error::InvalidArgument(format!(
            "expected end to be a char boundary in 0..={}, found {}",
            len, end
        )));
    }
    if begin > end {
        return Err(Error::InvalidArgument(format!(
            "expected begin value {} to be <= end value {}",
            begin, end
        )));
    }
    Ok(end)
}

/// Lazily yields substrings of `data` up to and including each newline.
///
/// Created by [`split_newlines_only`].
pub struct SplitNewlines<'a> {
    data: &'a str,
    pos: usize,
    start: usize,
    pre_line_return: usize,
    end: usize,
    keepends: bool,
    cleanends: bool,
    done: bool,
}

impl<'a> Iterator for SplitNewlines<'a> {
    type Item = Cow<'a, str>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let bytes = self.data.as_bytes();
        while self.pos < self.end {
            let b = bytes[self.pos];
            if self.cleanends && b != b'\r' && b != b'\n' {
                self.pre_line_return = self.pos + 1;
            }
            if b == b'\n' {
                let item = if self.cleanends {
                    let body = if self.pre_line_return > self.start {
                        &self.data[self.start..self.pre_line_return]
                    } else {
                        ""
                    };
                    let mut line = String::with_capacity(body.len() + 1);
                    line.push_str(body);
                    if self.keepends {
                        line.push('\n');
                    }
                    Cow::Owned(line)
                } else {
                    let stop = if self.keepends { self.pos + 1 } else { self.pos };
                    Cow::Borrowed(&self.data[self.start..stop])
                };
                self.start = self.pos + 1;
                self.pos += 1;
                if self.start == self.end {
                    self.done = true;
                }
                return Some(item);
            }
            self.pos += 1;
        }
        self.done = true;
        if self.start < self.data.len() {
            Some(Cow::Borrowed(&self.data[self.start..]))
        } else {
            None
        }
    }
}

/// Splits `data` at newline characters only, from `begin` to `end`.
///
/// Some devices emit runs of carriage returns without a matching line feed,
/// which breaks `str::lines` style splitting; this only ever splits at `\n`.
/// With `keepends` each complete line keeps its trailing line feed; with
/// `cleanends` trailing CR/LF runs are replaced by a single line feed (or
/// stripped, when `keepends` is false). Any trailing data without a newline
/// is yielded last as a partial line.
pub fn split_newlines_only(
    data: &str,
    begin: usize,
    end: Option<usize>,
    keepends: bool,
    cleanends: bool,
) -> Result<SplitNewlines<'_>> {
    let end = validate_range(data, begin, end)?;
    let mut pre_line_return = begin;
    if cleanends {
        // Walk back over any CR/LF run that straddles the begin offset.
        pre_line_return = 0;
        let bytes = data.as_bytes();
        let mut i = begin.min(data.len().saturating_sub(1));
        loop {
            if !bytes.is_empty() && bytes[i] != b'\r' && bytes[i] != b'\n' {
                pre_line_return = i + 1;
                break;
            }
            if i == 0 {
                break;
            }
            i -= 1;
        }
    }
    Ok(SplitNewlines {
        data,
        pos: begin,
        start: 0,
        pre_line_return,
        end,
        keepends,
        cleanends,
        done: false,
    })
}

/// Splits lines at each newline character.
///
/// This is the default framer.
#[derive(Debug, Clone)]
pub struct NewlineFramer {
    keepends: bool,
    cleanends: bool,
}

impl NewlineFramer {
    /// Creates a framer that keeps line feeds and cleans trailing CR/LF runs.
    pub fn new() -> Self {
        Self {
            keepends: true,
            cleanends: true,
        }
    }

    /// Keep the trailing line feed on complete lines.
    #[must_use]
    pub fn keepends(mut self, keepends: bool) -> Self {
        self.keepends = keepends;
        self
    }

    /// Replace trailing CR/LF runs with a single line feed.
    #[must_use]
    pub fn cleanends(mut self, cleanends: bool) -> Self {
        self.cleanends = cleanends;
        self
    }
}

impl Default for NewlineFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl DataFramer for NewlineFramer {
    fn get_lines(&self, raw_data: &str, begin: usize, end: Option<usize>) -> Result<Vec<String>> {
        Ok(
            split_newlines_only(raw_data, begin, end, self.keepends, self.cleanends)?
                .map(Cow::into_owned)
                .collect(),
        )
    }
}

/// Finds and extracts log lines that arrive interwoven with response lines.
///
/// The pattern must contain exactly one capture group holding the complete
/// log line (including its newline, or use `add_newline` to append one).
/// For each complete line the log portion is yielded first, followed by the
/// response remainder if any text is left over.
#[derive(Debug, Clone)]
pub struct InterwovenLogFramer {
    log_line_re: Regex,
    add_newline: bool,
    keepends: bool,
    cleanends: bool,
}

impl InterwovenLogFramer {
    /// Creates a framer extracting log lines matching `log_line_pattern`.
    pub fn new(log_line_pattern: &str) -> Result<Self> {
        let log_line_re = Regex::new(log_line_pattern)
            .map_err(|err| Error::InvalidArgument(format!("invalid log line pattern: {}", err)))?;
        if log_line_re.captures_len() < 2 {
            return Err(Error::InvalidArgument(format!(
                "log line pattern {:?} must contain a capture group",
                log_line_pattern
            )));
        }
        Ok(Self {
            log_line_re,
            add_newline: false,
            keepends: true,
            cleanends: true,
        })
    }

    /// Append a line feed to each extracted log line.
    #[must_use]
    pub fn add_newline(mut self, add_newline: bool) -> Self {
        self.add_newline = add_newline;
        self
    }

    /// Keep the trailing line feed on complete lines.
    #[must_use]
    pub fn keepends(mut self, keepends: bool) -> Self {
        self.keepends = keepends;
        self
    }

    /// Replace trailing CR/LF runs with a single line feed.
    #[must_use]
    pub fn cleanends(mut self, cleanends: bool) -> Self {
        self.cleanends = cleanends;
        self
    }
}

impl DataFramer for InterwovenLogFramer {
    fn get_lines(&self, raw_data: &str, begin: usize, end: Option<usize>) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        for raw_line in split_newlines_only(raw_data, begin, end, self.keepends, self.cleanends)? {
            if !raw_line.ends_with('\n') {
                lines.push(raw_line.into_owned());
            } else if let Some((whole, group)) = self
                .log_line_re
                .captures(&raw_line)
                .and_then(|caps| caps.get(0).zip(caps.get(1)))
            {
                let mut log_line = group.as_str().to_string();
                if self.add_newline {
                    log_line.push('\n');
                }
                lines.push(log_line);
                let mut response = String::with_capacity(raw_line.len() - whole.len());
                response.push_str(&raw_line[..whole.start()]);
                response.push_str(&raw_line[whole.end()..]);
                if !response.is_empty() {
                    lines.push(response);
                }
            } else {
                lines.push(raw_line.into_owned());
            }
        }
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(data: &str, keepends: bool, cleanends: bool) -> Vec<String> {
        split_newlines_only(data, 0, None, keepends, cleanends)
            .unwrap()
            .map(Cow::into_owned)
            .collect()
    }

    #[test]
    fn test_split_complete_and_partial_lines() {
        let lines = collect("one\ntwo\nthree", true, false);
        assert_eq!(lines, vec!["one\n", "two\n", "three"]);
    }

    #[test]
    fn test_split_round_trip() {
        let data = "mixed\r\n\rdata\nwith no final newline";
        let lines = collect(data, true, false);
        assert_eq!(lines.concat(), data);
    }

    #[test]
    fn test_split_keepends_false() {
        let lines = collect("one\ntwo\n", false, false);
        assert_eq!(lines, vec!["one", "two"]);
    }

    #[test]
    fn test_split_cleanends_strips_carriage_returns() {
        let lines = collect("one\r\r\ntwo\r\n", true, true);
        assert_eq!(lines, vec!["one\n", "two\n"]);
    }

    #[test]
    fn test_split_cleanends_without_keepends() {
        let lines = collect("one\r\r\n", true, false);
        assert_eq!(lines, vec!["one\r\r\n"]);
        let lines = collect("one\r\r\n", false, true);
        assert_eq!(lines, vec!["one"]);
    }

    #[test]
    fn test_split_blank_lines() {
        let lines = collect("\n\nend", true, true);
        assert_eq!(lines, vec!["\n", "\n", "end"]);
    }

    #[test]
    fn test_split_begin_skips_buffered_partial() {
        // begin points past a previously buffered partial line; the first
        // line returned still starts at the beginning of the data.
        let data = "partial now complete\nnext";
        let lines: Vec<String> = split_newlines_only(data, 7, None, true, false)
            .unwrap()
            .map(Cow::into_owned)
            .collect();
        assert_eq!(lines, vec!["partial now complete\n", "next"]);
    }

    #[test]
    fn test_split_begin_inside_line_return_run() {
        // A CR/LF run straddling the begin offset is still cleaned.
        let data = "partial\r\r\nnext";
        let lines: Vec<String> = split_newlines_only(data, 8, None, true, true)
            .unwrap()
            .map(Cow::into_owned)
            .collect();
        assert_eq!(lines, vec!["partial\n", "next"]);
    }

    #[test]
    fn test_split_rejects_bad_range() {
        assert!(split_newlines_only("abc", 4, None, true, false).is_err());
        assert!(split_newlines_only("abc", 2, Some(1), true, false).is_err());
        assert!(split_newlines_only("abc", 0, Some(9), true, false).is_err());
    }

    #[test]
    fn test_newline_framer() {
        let framer = NewlineFramer::new();
        let lines = framer.get_lines("a\r\nb\nc", 0, None).unwrap();
        assert_eq!(lines, vec!["a\n", "b\n", "c"]);
    }

    #[test]
    fn test_interwoven_framer_extracts_log_line() {
        let framer = InterwovenLogFramer::new(r"(\[Log\][^\n]*\n)").unwrap();
        let lines = framer
            .get_lines("response start [Log] noisy message\nresponse end\n", 0, None)
            .unwrap();
        assert_eq!(
            lines,
            vec![
                "[Log] noisy message\n",
                "response start ",
                "response end\n"
            ]
        );
    }

    #[test]
    fn test_interwoven_framer_add_newline() {
        let framer = InterwovenLogFramer::new(r"(\[Log\][^\n]*)\n")
            .unwrap()
            .add_newline(true);
        let lines = framer.get_lines("[Log] alone\n", 0, None).unwrap();
        assert_eq!(lines, vec!["[Log] alone\n"]);
    }

    #[test]
    fn test_interwoven_framer_passes_partial_lines() {
        let framer = InterwovenLogFramer::new(r"(\[Log\][^\n]*\n)").unwrap();
        let lines = framer.get_lines("no newline yet", 0, None).unwrap();
        assert_eq!(lines, vec!["no newline yet"]);
    }

    #[test]
    fn test_interwoven_framer_requires_capture_group() {
        assert!(InterwovenLogFramer::new(r"\[Log\][^\n]*\n").is_err());
    }
}
