//! Transport worker tasks
//!
//! Each transport runs inside its own tokio task that owns the transport
//! exclusively. The task loop services one command, one bounded write, and
//! one bounded read per pass, so a chatty device cannot starve commands
//! and a stuck write cannot block reads forever. Complete lines are
//! stamped and published to the log channel, and mirrored to the raw
//! channel while an expect call has it enabled.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::framer::DataFramer;
use crate::core::log_writer::{add_log_header, LogEvent};
use crate::core::transport::{properties, Transport, TransportCall};
use crate::error::{Error, Result};

/// Largest chunk handed to the transport per write pass.
pub const MAX_WRITE_BYTES: usize = 32;
/// Largest read requested from the transport per read pass.
pub const MAX_READ_BYTES: usize = 11520;
/// How long a single read pass waits for data.
pub const READ_TIMEOUT: Duration = Duration::from_millis(10);
/// Default wait before a line with no newline is published anyway.
pub const PARTIAL_LINE_TIMEOUT: Duration = Duration::from_millis(100);

const START_STOP_DEADLINE: Duration = Duration::from_secs(5);

/// Commands accepted by a worker task.
pub enum WorkerCommand {
    /// Open the transport.
    Open {
        /// Signaled with the open result.
        ack: Option<oneshot::Sender<Result<()>>>,
    },
    /// Close the transport and stay closed until the next `Open`.
    Close {
        /// Signaled once the transport is closed.
        ack: Option<oneshot::Sender<Result<()>>>,
    },
    /// Queue bytes for writing.
    Write(Vec<u8>),
    /// Invoke a transport method, reporting on the call-result channel.
    Call(TransportCall),
}

/// Channels a worker publishes into, shared across all workers.
#[derive(Clone)]
pub struct WorkerChannels {
    /// Stamped log lines for the log writer.
    pub log_tx: mpsc::UnboundedSender<LogEvent>,
    /// Unstamped lines for expect calls, gated by `raw_enabled`.
    pub raw_tx: mpsc::UnboundedSender<(usize, String)>,
    /// Publish to `raw_tx` only while set.
    pub raw_enabled: Arc<AtomicBool>,
    /// Results of `WorkerCommand::Call`, keyed by port.
    pub call_tx: mpsc::UnboundedSender<(usize, std::result::Result<String, String>)>,
    /// Transport errors the worker survived.
    pub fault_tx: mpsc::UnboundedSender<Error>,
}

struct Worker {
    port: usize,
    transport: Box<dyn Transport>,
    framer: Box<dyn DataFramer>,
    channels: WorkerChannels,
    partial_line_timeout: Duration,
    pending_writes: VecDeque<Vec<u8>>,
    buffered: String,
    last_data: Instant,
    open_flag: Arc<AtomicBool>,
    // False after an explicit close, so auto-reopen does not undo it.
    can_reopen: bool,
}

impl Worker {
    fn set_open_flag(&self) {
        self.open_flag
            .store(self.transport.is_open(), Ordering::Release);
    }

    fn fault(&mut self, reason: String) {
        warn!(port = self.port, %reason, "transport worker fault");
        let _ = self.channels.fault_tx.send(Error::WorkerFault {
            port: self.port,
            reason,
        });
    }

    fn auto_reopen(&self) -> bool {
        self.transport
            .get_property(properties::AUTO_REOPEN)
            .and_then(|value| value.as_bool())
            .unwrap_or(false)
    }

    /// Publishes one framed line: stamped to the log channel, verbatim to
    /// the raw channel when an expect call is listening.
    fn publish(&self, line: &str) {
        let _ = self
            .channels
            .log_tx
            .send(LogEvent::Line(add_log_header(line, &self.port.to_string())));
        if self.channels.raw_enabled.load(Ordering::Acquire) {
            let _ = self.channels.raw_tx.send((self.port, line.to_string()));
        }
    }

    async fn handle_command(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::Open { ack } => {
                let result = if self.transport.is_open() {
                    Ok(())
                } else {
                    self.transport.open().await
                };
                self.can_reopen = true;
                self.set_open_flag();
                if let Some(ack) = ack {
                    let _ = ack.send(result);
                } else if let Err(err) = result {
                    self.fault(err.to_string());
                }
            }
            WorkerCommand::Close { ack } => {
                let result = self.transport.close().await;
                self.can_reopen = false;
                self.buffered.clear();
                self.pending_writes.clear();
                self.set_open_flag();
                if let Some(ack) = ack {
                    let _ = ack.send(result);
                } else if let Err(err) = result {
                    self.fault(err.to_string());
                }
            }
            WorkerCommand::Write(data) => {
                self.pending_writes.push_back(data);
            }
            WorkerCommand::Call(call) => {
                let name = call.to_string();
                let result = self.execute_call(call).await;
                debug!(port = self.port, call = %name, ok = result.is_ok(), "transport call");
                let _ = self.channels.call_tx.send((self.port, result));
            }
        }
    }

    async fn execute_call(&mut self, call: TransportCall) -> std::result::Result<String, String> {
        let outcome = match call {
            TransportCall::FlushBuffers => {
                self.transport.flush_buffers().await.map(|_| String::new())
            }
            TransportCall::SendXon => self.transport.send_xon().await.map(|_| String::new()),
            TransportCall::SendXoff => self.transport.send_xoff().await.map(|_| String::new()),
            TransportCall::SendBreak => self.transport.send_break().await.map(|_| String::new()),
            TransportCall::SetProperty { key, value } => self
                .transport
                .set_property(&key, value)
                .map(|_| String::new()),
            TransportCall::GetProperty { key } => match self.transport.get_property(&key) {
                Some(Value::String(text)) => Ok(text),
                Some(value) => Ok(value.to_string()),
                None => Err(Error::TransportFailure(format!(
                    "transport has no property {:?}",
                    key
                ))),
            },
        };
        outcome.map_err(|err| err.to_string())
    }

    /// Writes at most one bounded chunk from the head of the write queue.
    async fn write_pass(&mut self) {
        let Some(front) = self.pending_writes.front_mut() else {
            return;
        };
        let chunk_len = front.len().min(MAX_WRITE_BYTES);
        let chunk = front[..chunk_len].to_vec();
        match self.transport.write(&chunk).await {
            Ok(written) => {
                front.drain(..written.min(front.len()));
                if front.is_empty() {
                    self.pending_writes.pop_front();
                }
            }
            Err(err) => {
                self.fault(format!("write failed: {}", err));
                self.close_after_fault().await;
            }
        }
    }

    /// Reads at most once, reframing the data into published lines. A
    /// trailing fragment waits for its newline until the partial-line
    /// timeout passes with nothing new, then goes out as-is.
    async fn read_pass(&mut self) {
        match self.transport.read(MAX_READ_BYTES, READ_TIMEOUT).await {
            Ok(data) if !data.is_empty() => {
                self.last_data = Instant::now();
                let mut text = std::mem::take(&mut self.buffered);
                let begin = text.len();
                text.push_str(&String::from_utf8_lossy(&data));
                match self.framer.get_lines(&text, begin, None) {
                    Ok(lines) => {
                        for line in lines {
                            if line.ends_with('\n') {
                                self.publish(&line);
                            } else {
                                self.buffered.push_str(&line);
                            }
                        }
                    }
                    Err(err) => self.fault(format!("framing failed: {}", err)),
                }
            }
            Ok(_) => {
                if !self.buffered.is_empty() && self.last_data.elapsed() >= self.partial_line_timeout
                {
                    let line = std::mem::take(&mut self.buffered);
                    self.publish(&line);
                }
            }
            Err(err) => {
                self.fault(format!("read failed: {}", err));
                self.close_after_fault().await;
            }
        }
    }

    /// Closes a faulted transport but leaves it eligible for auto-reopen.
    async fn close_after_fault(&mut self) {
        if let Err(err) = self.transport.close().await {
            warn!(port = self.port, %err, "close after fault failed");
        }
        self.set_open_flag();
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<WorkerCommand>,
        cancel: CancellationToken,
    ) {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            if let Ok(command) = cmd_rx.try_recv() {
                self.handle_command(command).await;
                continue;
            }
            if self.transport.is_open() {
                self.write_pass().await;
                self.read_pass().await;
            } else if self.can_reopen && self.auto_reopen() {
                // Release whatever half-dead handle is left before dialing again.
                if let Err(err) = self.transport.close().await {
                    warn!(port = self.port, %err, "close before reopen failed");
                }
                if let Err(err) = self.transport.open().await {
                    self.fault(format!("reopen failed: {}", err));
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(READ_TIMEOUT) => {}
                    }
                } else {
                    debug!(port = self.port, "transport reopened");
                }
                self.set_open_flag();
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(READ_TIMEOUT) => {}
                }
            }
        }
        if self.transport.is_open() {
            if let Err(err) = self.transport.close().await {
                warn!(port = self.port, %err, "close on shutdown failed");
            }
        }
        self.set_open_flag();
    }
}

/// Handle to a running transport worker.
pub struct WorkerHandle {
    port: usize,
    cmd_tx: mpsc::UnboundedSender<WorkerCommand>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
    open_flag: Arc<AtomicBool>,
}

impl WorkerHandle {
    /// Spawns a worker for `transport` publishing as `port`.
    ///
    /// When the transport's open-on-start property is set (the default for
    /// transports that leave it unset), the transport is opened before this
    /// returns and an open failure fails the spawn.
    pub async fn spawn(
        port: usize,
        transport: Box<dyn Transport>,
        framer: Box<dyn DataFramer>,
        channels: WorkerChannels,
        partial_line_timeout: Duration,
    ) -> Result<Self> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let open_flag = Arc::new(AtomicBool::new(false));

        let open_on_start = transport
            .get_property(properties::OPEN_ON_START)
            .and_then(|value| value.as_bool())
            .unwrap_or(true);
        let mut worker = Worker {
            port,
            transport,
            framer,
            channels,
            partial_line_timeout,
            pending_writes: VecDeque::new(),
            buffered: String::new(),
            last_data: Instant::now(),
            open_flag: Arc::clone(&open_flag),
            can_reopen: true,
        };
        let task_cancel = cancel.clone();
        let join = tokio::spawn(async move {
            let result = if open_on_start {
                worker.transport.open().await
            } else {
                Ok(())
            };
            worker.set_open_flag();
            let failed = result.is_err();
            let _ = ready_tx.send(result);
            if failed {
                return;
            }
            worker.run(cmd_rx, task_cancel).await;
        });

        match tokio::time::timeout(START_STOP_DEADLINE, ready_rx).await {
            Ok(Ok(Ok(()))) => Ok(Self {
                port,
                cmd_tx,
                cancel,
                join,
                open_flag,
            }),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_)) | Err(_) => Err(Error::TransportFailure(format!(
                "transport worker {} did not start",
                port
            ))),
        }
    }

    /// The port this worker publishes as.
    pub fn port(&self) -> usize {
        self.port
    }

    /// Whether the transport was open as of the worker's last pass.
    pub fn is_open(&self) -> bool {
        self.open_flag.load(Ordering::Acquire)
    }

    /// Sends a command to the worker.
    pub fn send_command(&self, command: WorkerCommand) -> Result<()> {
        self.cmd_tx.send(command).map_err(|_| {
            Error::TransportFailure(format!("transport worker {} is not running", self.port))
        })
    }

    /// Stops the worker, aborting it if it does not exit in time.
    pub async fn stop(self) {
        self.cancel.cancel();
        let abort = self.join.abort_handle();
        if tokio::time::timeout(START_STOP_DEADLINE, self.join)
            .await
            .is_err()
        {
            warn!(port = self.port, "transport worker did not stop; aborting");
            abort.abort();
        }
    }
}
