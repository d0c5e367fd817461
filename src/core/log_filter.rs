//! Log filtering: tailing the device log and recording events
//!
//! The filter task tails the log file written by the log writer with its
//! own descriptor, reframes partial reads into complete lines, and hands
//! each complete line to a [`Parser`] which appends matching events to the
//! event file. Rotation and log-switch marker lines written by the log
//! writer tell the filter when to follow the writer to the next file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::core::framer::{DataFramer, NewlineFramer};
use crate::core::log_writer::{
    event_filename, next_log_filename, HOST_TIMESTAMP_LENGTH, LOG_LINE_HEADER_LENGTH,
    NEW_LOG_FILE_MESSAGE, ROTATE_LOG_MESSAGE,
};
use crate::error::{Error, Result};

const MAX_READ_BYTES: usize = 4096;
const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Filters log lines, recording whatever it deems interesting.
pub trait Parser: Send {
    /// Loads additional filters from the file at `path`.
    fn load_filter_file(&mut self, path: &Path) -> Result<()>;

    /// Examines one complete log line, writing any resulting event records
    /// to `event_file`. `header_length` is the length of the stamp the log
    /// writer pipeline added; `log_filename` names the file the line was
    /// read from.
    fn process_line(
        &mut self,
        event_file: &mut dyn Write,
        raw_log_line: &str,
        header_length: usize,
        log_filename: &str,
    ) -> Result<()>;
}

enum FilterCommand {
    NewLogFile {
        path: PathBuf,
        ack: oneshot::Sender<()>,
    },
    AddFilter {
        path: PathBuf,
        ack: oneshot::Sender<Result<()>>,
    },
}

struct LogFilter {
    parser: Box<dyn Parser>,
    framer: NewlineFramer,
    buffered: String,
    log_path: PathBuf,
    log_file: Option<File>,
    event_path: PathBuf,
    event_file: Option<File>,
    next_log_paths: Vec<PathBuf>,
}

impl LogFilter {
    fn new(parser: Box<dyn Parser>, log_path: PathBuf) -> Self {
        let event_path = event_filename(&log_path);
        Self {
            parser,
            framer: NewlineFramer::new(),
            buffered: String::new(),
            log_path,
            log_file: None,
            event_path,
            event_file: None,
            next_log_paths: Vec::new(),
        }
    }

    fn handle_command(&mut self, command: FilterCommand) {
        match command {
            FilterCommand::NewLogFile { path, ack } => {
                self.next_log_paths.insert(0, path);
                let _ = ack.send(());
            }
            FilterCommand::AddFilter { path, ack } => {
                let _ = ack.send(self.parser.load_filter_file(&path));
            }
        }
    }

    fn open_files(&mut self) -> Result<()> {
        if self.log_file.is_none() {
            self.log_file = Some(File::open(&self.log_path)?);
        }
        if self.event_file.is_none() {
            if let Some(parent) = self.event_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            self.event_file = Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.event_path)?,
            );
        }
        Ok(())
    }

    /// Returns true when a marker line says the writer moved to another file.
    ///
    /// A rotation marker implies the conventional counter-suffixed name; a
    /// log-switch marker refers to a path already registered through
    /// `new_log_file`, which also moves the event file.
    fn is_log_swap_or_rotation(&mut self, log_line: &str) -> bool {
        if log_line.contains(ROTATE_LOG_MESSAGE) {
            self.next_log_paths.push(next_log_filename(&self.log_path));
            true
        } else if log_line.contains(NEW_LOG_FILE_MESSAGE) && !self.next_log_paths.is_empty() {
            if let Some(last) = self.next_log_paths.last() {
                self.event_path = event_filename(last);
            }
            true
        } else {
            false
        }
    }

    fn open_next_log_file(&mut self) {
        if let Some(new_log_path) = self.next_log_paths.pop() {
            debug!(path = %new_log_path.display(), "log filter following writer");
            self.log_file = None;
            self.event_file = None;
            self.buffered.clear();
            self.log_path = new_log_path;
        }
    }

    /// Reads and filters available log data; returns true if any was read.
    fn tick(&mut self) -> bool {
        if !self.log_path.is_file() {
            return false;
        }
        if let Err(err) = self.open_files() {
            warn!(path = %self.log_path.display(), %err, "log filter open failed");
            return false;
        }
        let mut buffer = vec![0u8; MAX_READ_BYTES];
        let count = match self.log_file.as_mut().map(|file| file.read(&mut buffer)) {
            Some(Ok(count)) => count,
            Some(Err(err)) => {
                warn!(path = %self.log_path.display(), %err, "log filter read failed");
                return false;
            }
            None => return false,
        };
        if count == 0 {
            return false;
        }

        let data = String::from_utf8_lossy(&buffer[..count]);
        let mut log_lines = std::mem::take(&mut self.buffered);
        let buffered_len = log_lines.len();
        log_lines.push_str(&data);

        let log_filename = self
            .log_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let header_length = HOST_TIMESTAMP_LENGTH + LOG_LINE_HEADER_LENGTH;
        let mut change_log_file = false;

        let lines = match self.framer.get_lines(&log_lines, buffered_len, None) {
            Ok(lines) => lines,
            Err(err) => {
                error!(%err, "log filter framing failed");
                return true;
            }
        };
        for log_line in lines {
            if log_line.ends_with('\n') {
                if let Some(event_file) = self.event_file.as_mut() {
                    if let Err(err) =
                        self.parser
                            .process_line(event_file, &log_line, header_length, &log_filename)
                    {
                        error!(%err, "event parser failed on log line");
                    }
                }
            } else {
                self.buffered.push_str(&log_line);
            }
            if self.is_log_swap_or_rotation(&log_line) {
                change_log_file = true;
            }
        }
        if change_log_file {
            self.open_next_log_file();
        }
        true
    }
}

/// Handle to the log filter task.
pub struct LogFilterHandle {
    cmd_tx: mpsc::UnboundedSender<FilterCommand>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl LogFilterHandle {
    /// Spawns a filter task tailing `log_path` with the given parser.
    pub fn spawn(parser: Box<dyn Parser>, log_path: &Path) -> Self {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let mut filter = LogFilter::new(parser, log_path.to_path_buf());
        let join = tokio::spawn(async move {
            loop {
                if task_cancel.is_cancelled() {
                    break;
                }
                while let Ok(command) = cmd_rx.try_recv() {
                    filter.handle_command(command);
                }
                if !filter.tick() {
                    tokio::select! {
                        _ = task_cancel.cancelled() => break,
                        _ = tokio::time::sleep(IDLE_SLEEP) => {}
                    }
                }
            }
        });
        Self {
            cmd_tx,
            cancel,
            join,
        }
    }

    /// Registers the log file the writer will switch to next.
    pub async fn new_log_file(&self, path: PathBuf) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.cmd_tx
            .send(FilterCommand::NewLogFile { path, ack })
            .map_err(|_| Error::TransportFailure("log filter is not running".into()))?;
        done.await
            .map_err(|_| Error::TransportFailure("log filter exited".into()))
    }

    /// Loads an additional filter file into the parser.
    pub async fn add_filter(&self, path: PathBuf) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.cmd_tx
            .send(FilterCommand::AddFilter { path, ack })
            .map_err(|_| Error::TransportFailure("log filter is not running".into()))?;
        done.await
            .map_err(|_| Error::TransportFailure("log filter exited".into()))?
    }

    /// Stops the filter task.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.join.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event_parser::EventFilterParser;
    use crate::core::log_writer::add_log_header;

    fn append(path: &Path, line: &str) {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(line.as_bytes()).unwrap();
        file.flush().unwrap();
    }

    async fn wait_for_contents(path: &Path, needle: &str) -> String {
        for _ in 0..400 {
            if let Ok(contents) = std::fs::read_to_string(path) {
                if contents.contains(needle) {
                    return contents;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "{} never contained {:?}: {:?}",
            path.display(),
            needle,
            std::fs::read_to_string(path).ok()
        );
    }

    fn power_parser(dir: &Path) -> Box<dyn Parser> {
        let filter_path = dir.join("power.json");
        std::fs::write(
            &filter_path,
            r#"{"filters": [{"name": "state", "regex_match": "power:(\\w+)"}]}"#,
        )
        .unwrap();
        Box::new(EventFilterParser::from_filter_files(&[filter_path]).unwrap())
    }

    #[tokio::test]
    async fn test_filter_records_matching_events() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("device.txt");
        let filter = LogFilterHandle::spawn(power_parser(dir.path()), &log_path);

        append(&log_path, &add_log_header("power:ON\n", "0"));
        let events = wait_for_contents(&dir.path().join("device-events.txt"), "power.state").await;
        assert!(events.contains("\"ON\""));
        filter.stop().await;
    }

    #[tokio::test]
    async fn test_filter_reassembles_partial_writes() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("device.txt");
        let filter = LogFilterHandle::spawn(power_parser(dir.path()), &log_path);

        let line = add_log_header("power:OFF\n", "0");
        let (head, tail) = line.split_at(line.len() / 2);
        append(&log_path, head);
        tokio::time::sleep(Duration::from_millis(50)).await;
        append(&log_path, tail);
        let events = wait_for_contents(&dir.path().join("device-events.txt"), "OFF").await;
        assert!(events.contains("power.state"));
        filter.stop().await;
    }

    #[tokio::test]
    async fn test_filter_follows_rotation_marker() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("device.txt");
        let filter = LogFilterHandle::spawn(power_parser(dir.path()), &log_path);

        append(
            &log_path,
            &add_log_header(
                &format!("{} device.txt to device.00001.txt\n", ROTATE_LOG_MESSAGE),
                "M",
            ),
        );
        append(
            &dir.path().join("device.00001.txt"),
            &add_log_header("power:LOW\n", "0"),
        );
        // Rotation keeps appending events to the original event file.
        let events = wait_for_contents(&dir.path().join("device-events.txt"), "LOW").await;
        assert!(events.contains("device.00001.txt"));
        filter.stop().await;
    }

    #[tokio::test]
    async fn test_filter_follows_log_switch_and_moves_event_file() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("device.txt");
        let new_log_path = dir.path().join("fresh.txt");
        let filter = LogFilterHandle::spawn(power_parser(dir.path()), &log_path);

        filter.new_log_file(new_log_path.clone()).await.unwrap();
        append(
            &log_path,
            &add_log_header(
                &format!("{} {}\n", NEW_LOG_FILE_MESSAGE, new_log_path.display()),
                "M",
            ),
        );
        append(&new_log_path, &add_log_header("power:FULL\n", "0"));
        let events = wait_for_contents(&dir.path().join("fresh-events.txt"), "FULL").await;
        assert!(events.contains("power.state"));
        filter.stop().await;
    }

    #[tokio::test]
    async fn test_add_filter_at_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("device.txt");
        let filter = LogFilterHandle::spawn(Box::new(EventFilterParser::new()), &log_path);

        let extra = dir.path().join("net.json");
        std::fs::write(
            &extra,
            r#"{"filters": [{"name": "up", "regex_match": "link up"}]}"#,
        )
        .unwrap();
        filter.add_filter(extra).await.unwrap();

        append(&log_path, &add_log_header("link up\n", "0"));
        let events = wait_for_contents(&dir.path().join("device-events.txt"), "net.up").await;
        assert!(!events.is_empty());
        filter.stop().await;
    }
}
