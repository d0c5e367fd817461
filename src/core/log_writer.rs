//! Log writing: header stamping, rotation, and log file switching
//!
//! A single writer task drains the shared log channel and appends every
//! line to the device log file, flushing after each line so the log filter
//! can tail it promptly. Producers stamp lines with a host timestamp and a
//! port header before queueing them; lines missing a newline are written
//! with a `[NO EOL]` tag. When a maximum size is configured the writer
//! rotates to a counter-suffixed file, announcing the switch with a marker
//! line that the log filter recognizes.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::{Error, Result};

/// Marker written when the maximum log size changes.
pub const CHANGE_MAX_LOG_SIZE_MESSAGE: &str = "Changing max_log_size";
/// Marker written when switching to a caller-provided log file.
pub const NEW_LOG_FILE_MESSAGE: &str = "Starting new log file at";
/// Marker written when rotating to a counter-suffixed log file.
pub const ROTATE_LOG_MESSAGE: &str = "Rotating from log file";
/// Tag appended to lines written without a trailing newline.
pub const NO_EOL_TAG: &str = "[NO EOL]\n";

/// Host timestamp format stamped onto every log line.
pub const HOST_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";
/// Length of the stamped host timestamp, including angle brackets.
pub const HOST_TIMESTAMP_LENGTH: usize = 28;
/// Length of the port header that follows the timestamp (" GDM-#: ").
pub const LOG_LINE_HEADER_LENGTH: usize = 8;

/// Port label used for orchestrator-originated log notes.
pub const MAIN_PORT_LABEL: &str = "M";

/// Prepends the host timestamp and port header to `raw_log_line`.
pub fn add_log_header(raw_log_line: &str, port: &str) -> String {
    let host_timestamp = Local::now().format(HOST_TIMESTAMP_FORMAT);
    format!("<{}> GDM-{}: {}", host_timestamp, port, raw_log_line)
}

fn split_extension(path: &str) -> (&str, &str) {
    match path.rfind('.') {
        Some(index) if !path[index..].contains('/') && index > 0 => path.split_at(index),
        _ => (path, ""),
    }
}

/// Returns the event filename for a given log path (extension replaced by
/// `-events.txt`).
pub fn event_filename(log_path: &Path) -> PathBuf {
    let path = log_path.to_string_lossy();
    let (no_ext, _) = split_extension(&path);
    PathBuf::from(format!("{}-events.txt", no_ext))
}

/// Returns the next log filename in the rotation sequence.
///
/// The first rotation of `device.txt` yields `device.00001.txt`; later
/// rotations increment the five-digit counter.
pub fn next_log_filename(current_log_path: &Path) -> PathBuf {
    let path = current_log_path.to_string_lossy();
    let (no_ext, ext) = split_extension(&path);
    let counter_suffix = no_ext.len() >= 6
        && no_ext.as_bytes()[no_ext.len() - 6] == b'.'
        && no_ext[no_ext.len() - 5..].bytes().all(|b| b.is_ascii_digit());
    let (base, counter) = if counter_suffix {
        let counter: u32 = no_ext[no_ext.len() - 5..].parse().unwrap_or(0);
        (&no_ext[..no_ext.len() - 6], counter)
    } else {
        (no_ext, 0)
    };
    PathBuf::from(format!("{}.{:05}{}", base, counter + 1, ext))
}

/// Events consumed by the log writer task.
#[derive(Debug)]
pub enum LogEvent {
    /// A stamped log line to append
    Line(String),
    /// Switch to a new log file, acknowledging once it is open
    NewLogFile {
        /// Path of the log file to switch to
        path: PathBuf,
        /// Acknowledged once the new file is open
        ack: oneshot::Sender<Result<()>>,
    },
    /// Change the rotation threshold, acknowledging once applied
    MaxLogSize {
        /// New maximum size in bytes; zero disables rotation
        bytes: u64,
        /// Acknowledged once the new threshold is active
        ack: oneshot::Sender<()>,
    },
}

struct LogWriter {
    file: File,
    path: PathBuf,
    size: u64,
    max_log_size: u64,
}

impl LogWriter {
    fn open(path: &Path, max_log_size: u64) -> Result<Self> {
        let (file, size) = open_log_file(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            size,
            max_log_size,
        })
    }

    fn write_log_line(&mut self, line: &str) -> std::io::Result<()> {
        if line.ends_with('\n') {
            self.file.write_all(line.as_bytes())?;
            self.size += line.len() as u64;
        } else {
            self.file.write_all(line.as_bytes())?;
            self.file.write_all(NO_EOL_TAG.as_bytes())?;
            self.size += (line.len() + NO_EOL_TAG.len()) as u64;
        }
        self.file.flush()
    }

    fn rotate_if_needed(&mut self) -> Result<()> {
        if self.max_log_size == 0 || self.size < self.max_log_size {
            return Ok(());
        }
        let current_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let next_path = next_log_filename(&self.path);
        let next_name = next_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let marker = add_log_header(
            &format!("{} {} to {}\n", ROTATE_LOG_MESSAGE, current_name, next_name),
            MAIN_PORT_LABEL,
        );
        self.write_log_line(&marker)?;
        debug!(from = %current_name, to = %next_name, "rotating log file");
        self.switch_to(&next_path)
    }

    fn switch_to(&mut self, path: &Path) -> Result<()> {
        self.file.flush()?;
        let (file, size) = open_log_file(path)?;
        self.file = file;
        self.size = size;
        self.path = path.to_path_buf();
        Ok(())
    }

    fn handle(&mut self, event: LogEvent) {
        match event {
            LogEvent::Line(line) => {
                if let Err(err) = self
                    .write_log_line(&line)
                    .map_err(Error::Io)
                    .and_then(|()| self.rotate_if_needed())
                {
                    error!(path = %self.path.display(), %err, "log write failed");
                }
            }
            LogEvent::NewLogFile { path, ack } => {
                let marker = add_log_header(
                    &format!("{} {}\n", NEW_LOG_FILE_MESSAGE, path.display()),
                    MAIN_PORT_LABEL,
                );
                let result = self
                    .write_log_line(&marker)
                    .map_err(Error::Io)
                    .and_then(|()| self.switch_to(&path));
                let _ = ack.send(result);
            }
            LogEvent::MaxLogSize { bytes, ack } => {
                let marker = add_log_header(
                    &format!(
                        "{} from {} to {}\n",
                        CHANGE_MAX_LOG_SIZE_MESSAGE, self.max_log_size, bytes
                    ),
                    MAIN_PORT_LABEL,
                );
                if let Err(err) = self.write_log_line(&marker) {
                    error!(path = %self.path.display(), %err, "log write failed");
                }
                self.max_log_size = bytes;
                let _ = ack.send(());
            }
        }
    }
}

fn open_log_file(path: &Path) -> Result<(File, u64)> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let size = file.metadata()?.len();
    Ok((file, size))
}

/// Handle to the log writer task.
pub struct LogWriterHandle {
    tx: mpsc::UnboundedSender<LogEvent>,
    join: JoinHandle<()>,
}

impl LogWriterHandle {
    /// Opens `log_path` and spawns the writer task.
    ///
    /// A `max_log_size` of zero disables rotation.
    pub fn spawn(log_path: &Path, max_log_size: u64) -> Result<Self> {
        let mut writer = LogWriter::open(log_path, max_log_size)?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let join = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                writer.handle(event);
            }
        });
        Ok(Self { tx, join })
    }

    /// Returns a sender that log line producers can keep.
    pub fn sender(&self) -> mpsc::UnboundedSender<LogEvent> {
        self.tx.clone()
    }

    /// Appends a stamped log line.
    pub fn send_line(&self, line: String) {
        let _ = self.tx.send(LogEvent::Line(line));
    }

    /// Switches to a new log file, waiting until it is open.
    pub async fn new_log_file(&self, path: PathBuf) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(LogEvent::NewLogFile { path, ack })
            .map_err(|_| Error::TransportFailure("log writer is not running".into()))?;
        done.await
            .map_err(|_| Error::TransportFailure("log writer exited during switch".into()))?
    }

    /// Changes the rotation threshold, waiting until it is applied.
    pub async fn set_max_log_size(&self, bytes: u64) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(LogEvent::MaxLogSize { bytes, ack })
            .map_err(|_| Error::TransportFailure("log writer is not running".into()))?;
        done.await
            .map_err(|_| Error::TransportFailure("log writer exited during resize".into()))
    }

    /// Drains remaining events and stops the writer task.
    pub async fn stop(self) {
        drop(self.tx);
        let _ = self.join.await;
    }
}
