//! Pattern matching over the live raw-line stream
//!
//! An expect call watches lines as the transport workers publish them,
//! matching regular expressions against a bounded sliding window of the
//! accepted text. The window holds at most twice the search window size,
//! so patterns can straddle line and chunk boundaries without the match
//! buffer growing with the log.

use std::time::Duration;

use regex::Regex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::core::identifier::{LineIdentifier, LineType};
use crate::error::{Error, Result};

/// Default bound, in bytes, on how far back a pattern may reach.
pub const DEFAULT_SEARCH_WINDOW_SIZE: usize = 2000;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// How a list of patterns must be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpectMode {
    /// Any one pattern matching completes the call.
    #[default]
    Any,
    /// Every pattern must match, in whatever order the output arrives.
    All,
    /// Every pattern must match, in list order.
    Sequential,
}

/// Tuning knobs for an expect call.
#[derive(Debug, Clone)]
pub struct ExpectOptions {
    /// Give up after this long.
    pub timeout: Duration,
    /// Bytes of accepted text a pattern may reach back over.
    pub search_window_size: usize,
    /// Which lines participate in matching.
    pub expect_type: LineType,
    /// How the pattern list must be satisfied.
    pub mode: ExpectMode,
    /// Turn a timed-out response into an error.
    pub raise_for_timeout: bool,
}

impl Default for ExpectOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            search_window_size: DEFAULT_SEARCH_WINDOW_SIZE,
            expect_type: LineType::All,
            mode: ExpectMode::Any,
            raise_for_timeout: false,
        }
    }
}

impl ExpectOptions {
    /// Sets the overall deadline.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the search window bound in bytes.
    #[must_use]
    pub fn search_window_size(mut self, size: usize) -> Self {
        self.search_window_size = size;
        self
    }

    /// Restricts matching to lines of the given type.
    #[must_use]
    pub fn expect_type(mut self, expect_type: LineType) -> Self {
        self.expect_type = expect_type;
        self
    }

    /// Sets how the pattern list must be satisfied.
    #[must_use]
    pub fn mode(mut self, mode: ExpectMode) -> Self {
        self.mode = mode;
        self
    }

    /// Makes a timed-out call return an error instead of a response.
    #[must_use]
    pub fn raise_for_timeout(mut self, raise: bool) -> Self {
        self.raise_for_timeout = raise;
        self
    }
}

/// Outcome of an expect call.
#[derive(Debug, Clone)]
pub struct ExpectResponse {
    /// Position in the pattern list of the last pattern that matched.
    pub index: Option<usize>,
    /// Accepted text before the final match, or all of it on timeout.
    pub before: String,
    /// Accepted text from the final match onward.
    pub after: Option<String>,
    /// Text of the final match.
    pub match_text: Option<String>,
    /// Text of every match, in the order they occurred.
    pub match_list: Vec<String>,
    /// Time spent waiting.
    pub time_elapsed: Duration,
    /// True if the deadline passed before the pattern list was satisfied.
    pub timedout: bool,
    /// Patterns that never matched, in list order.
    pub remaining: Vec<String>,
}

/// Compiles expect patterns, with `.` matching newlines and `^`/`$`
/// anchoring at line boundaries.
pub fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(&format!("(?sm){}", pattern)).map_err(|err| {
                Error::InvalidArgument(format!("invalid expect pattern {:?}: {}", pattern, err))
            })
        })
        .collect()
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(text: &str, mut index: usize) -> usize {
    while index < text.len() && !text.is_char_boundary(index) {
        index += 1;
    }
    index
}

struct MatchState {
    mode: ExpectMode,
    /// Positions still eligible to match, in the order they are tried.
    active: Vec<usize>,
    matched: Vec<bool>,
    expected_matches: usize,
    match_count: usize,
    next_sequential: usize,
}

impl MatchState {
    fn new(mode: ExpectMode, pattern_count: usize) -> Self {
        let active = match mode {
            ExpectMode::Any | ExpectMode::All => (0..pattern_count).collect(),
            ExpectMode::Sequential => vec![0],
        };
        let expected_matches = match mode {
            ExpectMode::Any => 1,
            ExpectMode::All | ExpectMode::Sequential => pattern_count,
        };
        Self {
            mode,
            active,
            matched: vec![false; pattern_count],
            expected_matches,
            match_count: 0,
            next_sequential: 0,
        }
    }

    fn record_match(&mut self, position: usize) {
        self.matched[position] = true;
        self.match_count += 1;
        match self.mode {
            ExpectMode::Any => {}
            ExpectMode::All => self.active.retain(|&p| p != position),
            ExpectMode::Sequential => {
                self.next_sequential += 1;
                self.active = if self.next_sequential < self.matched.len() {
                    vec![self.next_sequential]
                } else {
                    Vec::new()
                };
            }
        }
    }

    fn is_satisfied(&self) -> bool {
        self.match_count >= self.expected_matches
    }

    fn remaining(&self, patterns: &[String]) -> Vec<String> {
        patterns
            .iter()
            .enumerate()
            .filter(|(position, _)| !self.matched[*position])
            .map(|(_, pattern)| pattern.clone())
            .collect()
    }
}

/// Runs one expect call against the raw-line channel.
///
/// Lines the identifier rejects are dropped. Accepted lines are appended
/// to the captured text and fed to the matcher in search-window-sized
/// chunks; at most one pattern matches per chunk, and a non-final match
/// discards the window through its end so the same text cannot satisfy
/// the same pattern twice. Each match is reported through `note`.
pub(crate) async fn run_expect(
    raw_rx: &mut mpsc::UnboundedReceiver<(usize, String)>,
    identifier: &dyn LineIdentifier,
    compiled: &[Regex],
    patterns: &[String],
    opts: &ExpectOptions,
    mut note: impl FnMut(String),
) -> ExpectResponse {
    let started = Instant::now();
    let deadline = started + opts.timeout;
    let chunk_size = opts.search_window_size.max(1);
    let window_limit = chunk_size.saturating_mul(2);

    let mut state = MatchState::new(opts.mode, patterns.len());
    let mut captured = String::new();
    let mut window = String::new();
    // Characters fed into the window so far. The window is always a suffix
    // of this stream, so a match offset maps back into the captured text as
    // consumed - window.len() + match_start.
    let mut consumed = 0usize;
    let mut match_list = Vec::new();
    let mut last_index = None;

    'lines: loop {
        let line = match tokio::time::timeout_at(deadline, raw_rx.recv()).await {
            Ok(Some((port, line))) => {
                if !identifier.accept(port, &line, opts.expect_type) {
                    continue;
                }
                line
            }
            Ok(None) => {
                // All workers are gone; nothing more can match.
                tokio::time::sleep_until(deadline).await;
                break 'lines;
            }
            Err(_) => break 'lines,
        };

        captured.push_str(&line);
        let mut start = 0;
        while start < line.len() {
            let end = if start + chunk_size >= line.len() {
                line.len()
            } else {
                ceil_char_boundary(&line, start + chunk_size)
            };
            window.push_str(&line[start..end]);
            consumed += end - start;
            start = end;
            if window.len() > window_limit {
                let cut = ceil_char_boundary(&window, window.len() - window_limit);
                window.drain(..cut);
            }

            let found = state.active.iter().copied().find_map(|position| {
                compiled[position]
                    .find(&window)
                    .map(|m| (position, m.start(), m.end(), m.as_str().to_string()))
            });
            if let Some((position, match_start, match_end, match_text)) = found {
                note(format!(
                    "found pattern {:?} at index {}",
                    patterns[position], position
                ));
                last_index = Some(position);
                match_list.push(match_text.clone());
                state.record_match(position);
                if state.is_satisfied() {
                    let split =
                        floor_char_boundary(&captured, consumed - window.len() + match_start);
                    let remaining = state.remaining(patterns);
                    return ExpectResponse {
                        index: last_index,
                        before: captured[..split].to_string(),
                        after: Some(captured[split..].to_string()),
                        match_text: Some(match_text),
                        match_list,
                        time_elapsed: started.elapsed(),
                        timedout: false,
                        remaining,
                    };
                }
                window.drain(..match_end);
            }
        }
    }

    ExpectResponse {
        index: last_index,
        before: captured,
        after: None,
        match_text: None,
        match_list,
        time_elapsed: started.elapsed(),
        timedout: true,
        remaining: state.remaining(patterns),
    }
}
