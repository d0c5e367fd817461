//! Switchboard orchestration
//!
//! The switchboard owns one worker task per transport plus the log writer
//! and log filter tasks, and exposes the device-facing API: send commands,
//! expect patterns in the output, invoke transport methods, actuate
//! buttons, and manage the log files. All device output flows through the
//! log channel continuously; the raw channel feeding expect calls is only
//! enabled while at least one expect call is running.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::button::Button;
use crate::core::expect::{compile_patterns, run_expect, ExpectOptions, ExpectResponse};
use crate::core::framer::{DataFramer, NewlineFramer};
use crate::core::identifier::{AllUnknownIdentifier, LineIdentifier};
use crate::core::log_filter::{LogFilterHandle, Parser};
use crate::core::log_writer::{
    add_log_header, LogEvent, LogWriterHandle, MAIN_PORT_LABEL,
};
use crate::core::transport::{Transport, TransportCall};
use crate::core::worker::{WorkerChannels, WorkerCommand, WorkerHandle, PARTIAL_LINE_TIMEOUT};
use crate::error::{Error, Result};

const DEFAULT_MAX_LOG_SIZE: u64 = 100 * 1024 * 1024;
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// How a command is written to a transport.
#[derive(Debug, Clone)]
pub struct SendOptions {
    /// Which transport receives the command.
    pub port: usize,
    /// Write one byte per worker pass instead of bounded chunks.
    pub slow: bool,
    /// Append `newline` when the command does not already end with it.
    pub add_newline: bool,
    /// Line terminator appended by `add_newline`.
    pub newline: String,
    /// How many times `send_and_expect` retries a timed-out command.
    pub command_tries: usize,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            port: 0,
            slow: false,
            add_newline: true,
            newline: "\n".to_string(),
            command_tries: 1,
        }
    }
}

impl SendOptions {
    /// Targets the given transport.
    #[must_use]
    pub fn port(mut self, port: usize) -> Self {
        self.port = port;
        self
    }

    /// Writes one byte per worker pass.
    #[must_use]
    pub fn slow(mut self, slow: bool) -> Self {
        self.slow = slow;
        self
    }

    /// Controls whether a missing line terminator is appended.
    #[must_use]
    pub fn add_newline(mut self, add: bool) -> Self {
        self.add_newline = add;
        self
    }

    /// Sets the line terminator used by `add_newline`.
    #[must_use]
    pub fn newline(mut self, newline: impl Into<String>) -> Self {
        self.newline = newline.into();
        self
    }

    /// Sets how many attempts `send_and_expect` makes.
    #[must_use]
    pub fn command_tries(mut self, tries: usize) -> Self {
        self.command_tries = tries;
        self
    }
}

/// Builds a [`Switchboard`].
pub struct SwitchboardBuilder {
    device_name: String,
    log_path: PathBuf,
    max_log_size: u64,
    force_slow: bool,
    transports: Vec<(Box<dyn Transport>, Box<dyn DataFramer>, Duration)>,
    identifier: Box<dyn LineIdentifier>,
    button: Option<Box<dyn Button>>,
    parser: Option<Box<dyn Parser>>,
}

impl SwitchboardBuilder {
    /// Starts a builder for `device_name` logging to `log_path`.
    pub fn new(device_name: impl Into<String>, log_path: impl Into<PathBuf>) -> Self {
        Self {
            device_name: device_name.into(),
            log_path: log_path.into(),
            max_log_size: DEFAULT_MAX_LOG_SIZE,
            force_slow: false,
            transports: Vec::new(),
            identifier: Box::new(AllUnknownIdentifier),
            button: None,
            parser: None,
        }
    }

    /// Adds a transport framed by newlines with the default partial-line
    /// timeout. Ports number transports in the order they are added.
    #[must_use]
    pub fn transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transports
            .push((transport, Box::new(NewlineFramer::new()), PARTIAL_LINE_TIMEOUT));
        self
    }

    /// Adds a transport with its own framer and partial-line timeout.
    #[must_use]
    pub fn transport_with_framer(
        mut self,
        transport: Box<dyn Transport>,
        framer: Box<dyn DataFramer>,
        partial_line_timeout: Duration,
    ) -> Self {
        self.transports.push((transport, framer, partial_line_timeout));
        self
    }

    /// Sets the line identifier used to filter expect input.
    #[must_use]
    pub fn identifier(mut self, identifier: Box<dyn LineIdentifier>) -> Self {
        self.identifier = identifier;
        self
    }

    /// Attaches a button capability.
    #[must_use]
    pub fn button(mut self, button: Box<dyn Button>) -> Self {
        self.button = Some(button);
        self
    }

    /// Sets the event parser fed by the log filter.
    #[must_use]
    pub fn parser(mut self, parser: Box<dyn Parser>) -> Self {
        self.parser = Some(parser);
        self
    }

    /// Caps the log file size before rotation.
    #[must_use]
    pub fn max_log_size(mut self, bytes: u64) -> Self {
        self.max_log_size = bytes;
        self
    }

    /// Forces every send into slow byte-at-a-time mode.
    #[must_use]
    pub fn force_slow(mut self, force: bool) -> Self {
        self.force_slow = force;
        self
    }

    /// Spawns the writer, filter, and worker tasks.
    pub async fn build(self) -> Result<Switchboard> {
        let writer = LogWriterHandle::spawn(&self.log_path, self.max_log_size)?;
        let parser = self
            .parser
            .unwrap_or_else(|| Box::new(crate::core::event_parser::EventFilterParser::new()));
        let filter = LogFilterHandle::spawn(parser, &self.log_path);

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (call_tx, call_rx) = mpsc::unbounded_channel();
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();
        let channels = WorkerChannels {
            log_tx: writer.sender(),
            raw_tx,
            raw_enabled: Arc::new(AtomicBool::new(false)),
            call_tx,
            fault_tx,
        };

        let transport_count = self.transports.len();
        let mut workers = Vec::with_capacity(transport_count);
        for (port, (transport, framer, partial_line_timeout)) in
            self.transports.into_iter().enumerate()
        {
            match WorkerHandle::spawn(port, transport, framer, channels.clone(), partial_line_timeout)
                .await
            {
                Ok(worker) => workers.push(worker),
                Err(err) => {
                    for worker in workers {
                        worker.stop().await;
                    }
                    drop(channels);
                    writer.stop().await;
                    filter.stop().await;
                    return Err(err);
                }
            }
        }

        info!(
            device = %self.device_name,
            transports = transport_count,
            log = %self.log_path.display(),
            "switchboard started"
        );
        let switchboard = Switchboard {
            device_name: self.device_name,
            workers,
            writer,
            filter,
            identifier: self.identifier,
            button: self.button,
            channels,
            raw_rx: tokio::sync::Mutex::new(raw_rx),
            call_rx: tokio::sync::Mutex::new(call_rx),
            fault_rx: parking_lot::Mutex::new(fault_rx),
            raw_refcount: parking_lot::Mutex::new(0),
            force_slow: self.force_slow,
        };
        switchboard.add_log_note(&format!(
            "switchboard for {} started with {} transport(s)",
            switchboard.device_name, transport_count
        ));
        Ok(switchboard)
    }
}

/// Orchestrates transports, logging, and expect matching for one device.
pub struct Switchboard {
    device_name: String,
    workers: Vec<WorkerHandle>,
    writer: LogWriterHandle,
    filter: LogFilterHandle,
    identifier: Box<dyn LineIdentifier>,
    button: Option<Box<dyn Button>>,
    channels: WorkerChannels,
    raw_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(usize, String)>>,
    call_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(usize, std::result::Result<String, String>)>>,
    fault_rx: parking_lot::Mutex<mpsc::UnboundedReceiver<Error>>,
    raw_refcount: parking_lot::Mutex<usize>,
    force_slow: bool,
}

impl Switchboard {
    /// The device this switchboard fronts.
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Number of attached transports.
    pub fn number_transports(&self) -> usize {
        self.workers.len()
    }

    fn check_port(&self, port: usize) -> Result<&WorkerHandle> {
        self.workers.get(port).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "port {} is out of range; {} transport(s) attached",
                port,
                self.workers.len()
            ))
        })
    }

    fn check_button(&self, button: &str) -> Result<&dyn Button> {
        let capability = self.button.as_deref().ok_or_else(|| {
            Error::InvalidArgument(format!(
                "device {} has no button capability",
                self.device_name
            ))
        })?;
        if !capability.is_valid(button) {
            return Err(Error::InvalidArgument(format!(
                "invalid button {:?}; valid buttons are {:?}",
                button,
                capability.valid_buttons()
            )));
        }
        Ok(capability)
    }

    /// Writes an orchestrator note into the device log.
    pub fn add_log_note(&self, note: &str) {
        for line in note.lines() {
            let stamped = add_log_header(&format!("Note: {}\n", line), MAIN_PORT_LABEL);
            let _ = self.channels.log_tx.send(LogEvent::Line(stamped));
        }
    }

    /// Queues `command` for writing to a transport.
    pub fn send(&self, command: &str, opts: &SendOptions) -> Result<()> {
        let worker = self.check_port(opts.port)?;
        self.add_log_note(&format!("wrote command {:?} to port {}", command, opts.port));
        let mut payload = command.to_string();
        if opts.add_newline && !payload.ends_with(&opts.newline) {
            payload.push_str(&opts.newline);
        }
        if opts.slow || self.force_slow {
            // One byte per command paces the bytes a worker pass apart.
            for byte in payload.into_bytes() {
                worker.send_command(WorkerCommand::Write(vec![byte]))?;
            }
        } else {
            worker.send_command(WorkerCommand::Write(payload.into_bytes()))?;
        }
        Ok(())
    }

    async fn enable_raw(&self) {
        let first = {
            let mut count = self.raw_refcount.lock();
            *count += 1;
            *count == 1
        };
        if first {
            // Drop lines published before anyone was listening.
            let mut raw_rx = self.raw_rx.lock().await;
            while raw_rx.try_recv().is_ok() {}
            self.channels.raw_enabled.store(true, Ordering::Release);
        }
    }

    async fn disable_raw(&self) {
        let last = {
            let mut count = self.raw_refcount.lock();
            *count = count.saturating_sub(1);
            *count == 0
        };
        if last {
            self.channels.raw_enabled.store(false, Ordering::Release);
            let mut raw_rx = self.raw_rx.lock().await;
            while raw_rx.try_recv().is_ok() {}
        }
    }

    /// Runs `action` with the raw channel enabled, then expects on the
    /// output. Enabling before the action means output the action provokes
    /// cannot race past the matcher. The receiver is only locked for the
    /// match loop itself, so the action may run nested expect calls; the
    /// reference count keeps the raw channel enabled across all of them.
    async fn guarded_expect<F, Fut>(
        &self,
        patterns: &[String],
        opts: &ExpectOptions,
        action: F,
    ) -> Result<ExpectResponse>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        if patterns.is_empty() {
            return Err(Error::InvalidArgument(
                "expect requires at least one pattern".to_string(),
            ));
        }
        let compiled = compile_patterns(patterns)?;
        self.enable_raw().await;
        let action_result = action().await;
        let response = if action_result.is_ok() {
            let mut raw_rx = self.raw_rx.lock().await;
            Some(
                run_expect(
                    &mut raw_rx,
                    self.identifier.as_ref(),
                    &compiled,
                    patterns,
                    opts,
                    |note| self.add_log_note(&note),
                )
                .await,
            )
        } else {
            None
        };
        self.disable_raw().await;
        action_result?;
        let response = response.expect("response exists when action succeeded");
        if response.timedout {
            debug!(
                device = %self.device_name,
                unmatched = ?response.remaining,
                "expect timed out"
            );
            self.add_log_note(&format!(
                "expect timed out after {:?}; unmatched patterns {:?}",
                opts.timeout, response.remaining
            ));
            if opts.raise_for_timeout {
                return Err(Error::CommunicationTimeout(format!(
                    "expect timed out after {:?}; unmatched patterns {:?}",
                    opts.timeout, response.remaining
                )));
            }
        } else {
            self.add_log_note(&format!(
                "expect completed after {:?}",
                response.time_elapsed
            ));
        }
        Ok(response)
    }

    /// Waits for device output matching the pattern list.
    pub async fn expect(
        &self,
        patterns: &[String],
        opts: &ExpectOptions,
    ) -> Result<ExpectResponse> {
        self.guarded_expect(patterns, opts, || async { Ok(()) })
            .await
    }

    /// Runs `action` and expects on the output it provokes.
    pub async fn do_and_expect<F, Fut>(
        &self,
        action: F,
        patterns: &[String],
        opts: &ExpectOptions,
    ) -> Result<ExpectResponse>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        self.guarded_expect(patterns, opts, action).await
    }

    /// Sends `command` and expects on the response, retrying timed-out
    /// attempts up to `opts.command_tries` times.
    pub async fn send_and_expect(
        &self,
        command: &str,
        patterns: &[String],
        send_opts: &SendOptions,
        expect_opts: &ExpectOptions,
    ) -> Result<ExpectResponse> {
        let tries = send_opts.command_tries.max(1);
        let attempt_opts = expect_opts.clone().raise_for_timeout(false);
        let mut last = None;
        for attempt in 0..tries {
            if attempt > 0 {
                debug!(
                    device = %self.device_name,
                    attempt = attempt + 1,
                    %command,
                    "retrying command after expect timeout"
                );
            }
            let response = self
                .guarded_expect(patterns, &attempt_opts, || async {
                    self.send(command, send_opts)
                })
                .await?;
            if !response.timedout {
                return Ok(response);
            }
            last = Some(response);
        }
        let response = last.expect("at least one attempt ran");
        if expect_opts.raise_for_timeout {
            return Err(Error::CommunicationTimeout(format!(
                "command {:?} got no match in {} attempt(s); unmatched patterns {:?}",
                command, tries, response.remaining
            )));
        }
        Ok(response)
    }

    /// Invokes a transport method on the worker owning `port`.
    pub async fn call(&self, port: usize, call: TransportCall) -> Result<String> {
        let worker = self.check_port(port)?;
        let mut call_rx = self.call_rx.lock().await;
        // Results of calls abandoned by a cancelled caller.
        while call_rx.try_recv().is_ok() {}
        let name = call.to_string();
        worker.send_command(WorkerCommand::Call(call))?;
        let deadline = Instant::now() + CALL_TIMEOUT;
        loop {
            let (result_port, result) = tokio::time::timeout_at(deadline, call_rx.recv())
                .await
                .map_err(|_| {
                    Error::CommunicationTimeout(format!(
                        "transport call {} on port {} got no result in {:?}",
                        name, port, CALL_TIMEOUT
                    ))
                })?
                .ok_or_else(|| {
                    Error::TransportFailure("transport workers are not running".to_string())
                })?;
            if result_port == port {
                return result.map_err(Error::TransportFailure);
            }
            warn!(port = result_port, "discarding stale transport call result");
        }
    }

    /// Invokes a transport method and expects on the output it provokes.
    pub async fn call_and_expect(
        &self,
        port: usize,
        call: TransportCall,
        patterns: &[String],
        opts: &ExpectOptions,
    ) -> Result<(String, ExpectResponse)> {
        let mut call_result = None;
        let response = self
            .guarded_expect(patterns, opts, || async {
                call_result = Some(self.call(port, call).await?);
                Ok(())
            })
            .await?;
        Ok((
            call_result.expect("call ran before expect"),
            response,
        ))
    }

    /// Presses `button` and waits `wait` before returning.
    pub async fn press(&self, button: &str, wait: Duration) -> Result<()> {
        let capability = self.check_button(button)?;
        self.add_log_note(&format!("pressed button {:?}", button));
        capability.press(button, wait).await
    }

    /// Releases `button`.
    pub async fn release(&self, button: &str) -> Result<()> {
        let capability = self.check_button(button)?;
        self.add_log_note(&format!("released button {:?}", button));
        capability.release(button).await
    }

    /// Presses and releases `button`, holding it for `duration`.
    pub async fn click(&self, button: &str, duration: Duration) -> Result<()> {
        let capability = self.check_button(button)?;
        self.add_log_note(&format!("clicked button {:?}", button));
        capability.click(button, duration).await
    }

    /// Clicks `button` and expects on the output it provokes.
    pub async fn click_and_expect(
        &self,
        button: &str,
        duration: Duration,
        patterns: &[String],
        opts: &ExpectOptions,
    ) -> Result<ExpectResponse> {
        self.check_button(button)?;
        self.guarded_expect(patterns, opts, || async {
            self.click(button, duration).await
        })
        .await
    }

    /// Presses `button` and expects on the output it provokes.
    pub async fn press_and_expect(
        &self,
        button: &str,
        wait: Duration,
        patterns: &[String],
        opts: &ExpectOptions,
    ) -> Result<ExpectResponse> {
        self.check_button(button)?;
        self.guarded_expect(patterns, opts, || async { self.press(button, wait).await })
            .await
    }

    /// Releases `button` and expects on the output it provokes.
    pub async fn release_and_expect(
        &self,
        button: &str,
        patterns: &[String],
        opts: &ExpectOptions,
    ) -> Result<ExpectResponse> {
        self.check_button(button)?;
        self.guarded_expect(patterns, opts, || async { self.release(button).await })
            .await
    }

    async fn transport_ack(
        &self,
        port: usize,
        make: impl FnOnce(oneshot::Sender<Result<()>>) -> WorkerCommand,
        what: &str,
    ) -> Result<()> {
        let worker = self.check_port(port)?;
        let (ack, done) = oneshot::channel();
        worker.send_command(make(ack))?;
        tokio::time::timeout(CALL_TIMEOUT, done)
            .await
            .map_err(|_| {
                Error::CommunicationTimeout(format!(
                    "transport {} on port {} did not finish in {:?}",
                    what, port, CALL_TIMEOUT
                ))
            })?
            .map_err(|_| Error::TransportFailure(format!("transport worker {} exited", port)))?
    }

    /// Opens the transport on `port`.
    pub async fn open_transport(&self, port: usize) -> Result<()> {
        self.transport_ack(port, |ack| WorkerCommand::Open { ack: Some(ack) }, "open")
            .await?;
        self.add_log_note(&format!("opened transport on port {}", port));
        Ok(())
    }

    /// Closes the transport on `port`. It stays closed until reopened.
    pub async fn close_transport(&self, port: usize) -> Result<()> {
        self.transport_ack(port, |ack| WorkerCommand::Close { ack: Some(ack) }, "close")
            .await?;
        self.add_log_note(&format!("closed transport on port {}", port));
        Ok(())
    }

    /// Opens every transport.
    pub async fn open_all_transports(&self) -> Result<()> {
        for port in 0..self.workers.len() {
            self.open_transport(port).await?;
        }
        Ok(())
    }

    /// Closes every transport.
    pub async fn close_all_transports(&self) -> Result<()> {
        for port in 0..self.workers.len() {
            self.close_transport(port).await?;
        }
        Ok(())
    }

    /// Whether the transport on `port` was open as of its worker's last pass.
    pub fn is_transport_open(&self, port: usize) -> Result<bool> {
        Ok(self.check_port(port)?.is_open())
    }

    /// Switches logging to a new file; the filter follows the marker the
    /// writer leaves in the old one.
    pub async fn start_new_log(&self, log_path: PathBuf) -> Result<()> {
        // The filter must know the destination before the marker appears.
        self.filter.new_log_file(log_path.clone()).await?;
        self.writer.new_log_file(log_path).await
    }

    /// Changes the rotation threshold of the current log file.
    pub async fn set_max_log_size(&self, bytes: u64) -> Result<()> {
        self.writer.set_max_log_size(bytes).await
    }

    /// Loads an additional event filter file into the running parser.
    pub async fn add_new_filter(&self, path: PathBuf) -> Result<()> {
        if !path.is_file() {
            return Err(Error::InvalidArgument(format!(
                "filter file {} does not exist",
                path.display()
            )));
        }
        self.filter.add_filter(path).await
    }

    /// Drains transport faults the workers survived since the last call.
    pub fn faults(&self) -> Vec<Error> {
        let mut fault_rx = self.fault_rx.lock();
        let mut faults = Vec::new();
        while let Ok(fault) = fault_rx.try_recv() {
            faults.push(fault);
        }
        faults
    }

    /// Stops every task, closing transports and flushing the log.
    pub async fn close(mut self) {
        self.add_log_note("closing switchboard");
        for worker in self.workers.drain(..) {
            worker.stop().await;
        }
        if let Some(button) = &self.button {
            if let Err(err) = button.close().await {
                warn!(device = %self.device_name, %err, "button close failed");
            }
        }
        let Switchboard {
            writer,
            filter,
            channels,
            ..
        } = self;
        // The writer drains until every log sender is gone.
        drop(channels);
        writer.stop().await;
        // One last pass so the filter sees everything the writer flushed.
        tokio::time::sleep(Duration::from_millis(100)).await;
        filter.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::MockTransport;

    fn patterns(list: &[&str]) -> Vec<String> {
        list.iter().map(|p| p.to_string()).collect()
    }

    async fn mock_switchboard(dir: &std::path::Path) -> (Switchboard, MockTransport) {
        let mock = MockTransport::new();
        let switchboard = SwitchboardBuilder::new("testdev", dir.join("testdev.txt"))
            .transport(Box::new(mock.clone()))
            .build()
            .await
            .unwrap();
        (switchboard, mock)
    }

    #[tokio::test]
    async fn test_send_appends_newline_and_writes() {
        let dir = tempfile::tempdir().unwrap();
        let (switchboard, mock) = mock_switchboard(dir.path()).await;
        switchboard.send("version", &SendOptions::default()).unwrap();
        for _ in 0..400 {
            if mock.written_text() == "version\n" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(mock.written_text(), "version\n");
        switchboard.close().await;
    }

    #[tokio::test]
    async fn test_send_to_unknown_port_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (switchboard, _mock) = mock_switchboard(dir.path()).await;
        let err = switchboard
            .send("hi", &SendOptions::default().port(3))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        switchboard.close().await;
    }

    #[tokio::test]
    async fn test_expect_rejects_empty_pattern_list() {
        let dir = tempfile::tempdir().unwrap();
        let (switchboard, _mock) = mock_switchboard(dir.path()).await;
        let err = switchboard
            .expect(&[], &ExpectOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        switchboard.close().await;
    }

    #[tokio::test]
    async fn test_expect_rejects_invalid_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let (switchboard, _mock) = mock_switchboard(dir.path()).await;
        let err = switchboard
            .expect(&patterns(&["(oops"]), &ExpectOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        switchboard.close().await;
    }

    #[tokio::test]
    async fn test_do_and_expect_captures_provoked_output() {
        let dir = tempfile::tempdir().unwrap();
        let (switchboard, mock) = mock_switchboard(dir.path()).await;
        let response = switchboard
            .do_and_expect(
                || async {
                    mock.enqueue_read("provoked output\n");
                    Ok(())
                },
                &patterns(&["provoked"]),
                &ExpectOptions::default().timeout(Duration::from_secs(5)),
            )
            .await
            .unwrap();
        assert!(!response.timedout);
        assert_eq!(response.index, Some(0));
        switchboard.close().await;
    }

    #[tokio::test]
    async fn test_nested_expect_inside_do_and_expect() {
        let dir = tempfile::tempdir().unwrap();
        let (switchboard, mock) = mock_switchboard(dir.path()).await;
        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            switchboard.do_and_expect(
                || async {
                    mock.enqueue_read("inner ready\n");
                    let inner = switchboard
                        .expect(
                            &patterns(&["inner ready"]),
                            &ExpectOptions::default().timeout(Duration::from_secs(5)),
                        )
                        .await?;
                    assert!(!inner.timedout);
                    mock.enqueue_read("outer done\n");
                    Ok(())
                },
                &patterns(&["outer done"]),
                &ExpectOptions::default().timeout(Duration::from_secs(5)),
            ),
        )
        .await
        .expect("nested expect must not block the outer call");
        let response = outcome.unwrap();
        assert!(!response.timedout);
        assert_eq!(response.index, Some(0));
        switchboard.close().await;
    }

    #[tokio::test]
    async fn test_transport_call_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (switchboard, mock) = mock_switchboard(dir.path()).await;
        mock.enqueue_read("stale\n");
        switchboard
            .call(0, TransportCall::FlushBuffers)
            .await
            .unwrap();
        assert_eq!(mock.pending_reads(), 0);
        switchboard.close().await;
    }

    #[tokio::test]
    async fn test_close_and_open_transport() {
        let dir = tempfile::tempdir().unwrap();
        let (switchboard, mock) = mock_switchboard(dir.path()).await;
        switchboard.close_transport(0).await.unwrap();
        assert!(!switchboard.is_transport_open(0).unwrap());
        assert_eq!(mock.close_count(), 1);
        switchboard.open_transport(0).await.unwrap();
        assert!(switchboard.is_transport_open(0).unwrap());
        switchboard.close().await;
    }

    #[tokio::test]
    async fn test_button_calls_without_capability_fail() {
        let dir = tempfile::tempdir().unwrap();
        let (switchboard, _mock) = mock_switchboard(dir.path()).await;
        let err = switchboard
            .click("reset", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        switchboard.close().await;
    }

    #[tokio::test]
    async fn test_build_fails_when_transport_cannot_open() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockTransport::new();
        mock.fail_open("unplugged");
        let result = SwitchboardBuilder::new("testdev", dir.path().join("testdev.txt"))
            .transport(Box::new(mock))
            .build()
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_add_new_filter_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let (switchboard, _mock) = mock_switchboard(dir.path()).await;
        let err = switchboard
            .add_new_filter(dir.path().join("missing.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        switchboard.close().await;
    }
}
