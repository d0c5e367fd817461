//! Scripted in-memory transport for tests
//!
//! `MockTransport` simulates a device without hardware: tests enqueue the
//! bytes each read should return, script replies to writes, and inspect
//! everything that was written. Cloning returns a handle to the same
//! scripted state, so a test can keep driving the mock after handing it to
//! a switchboard.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::time::sleep;

use super::{properties, PropertyMap, Transport};
use crate::error::{Error, Result};

#[derive(Default)]
struct MockState {
    open: bool,
    fail_open: Option<String>,
    fail_read: Option<String>,
    reads: VecDeque<Bytes>,
    writes: Vec<Vec<u8>>,
    replies: VecDeque<Option<Bytes>>,
    open_count: usize,
    close_count: usize,
    props: PropertyMap,
}

/// Scripted in-memory transport.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Creates a mock transport with no scripted data.
    pub fn new() -> Self {
        let mut props = PropertyMap::new();
        props.set(properties::OPEN_ON_START, json!(true));
        props.set(properties::AUTO_REOPEN, json!(false));
        let state = MockState {
            props,
            ..MockState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Enqueues one chunk of bytes to be returned by a future read.
    pub fn enqueue_read(&self, data: impl Into<Bytes>) {
        self.state.lock().reads.push_back(data.into());
    }

    /// Enqueues each item as one read chunk.
    pub fn enqueue_reads<I, B>(&self, chunks: I)
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let mut state = self.state.lock();
        for chunk in chunks {
            state.reads.push_back(chunk.into());
        }
    }

    /// Scripts the reaction to the next write: `Some(bytes)` enqueues the
    /// bytes as read data, `None` swallows the write silently.
    pub fn script_reply(&self, reply: Option<Bytes>) {
        self.state.lock().replies.push_back(reply);
    }

    /// Makes subsequent opens fail with the given message.
    pub fn fail_open(&self, message: &str) {
        self.state.lock().fail_open = Some(message.to_string());
    }

    /// Makes subsequent reads fail with the given message.
    pub fn fail_read(&self, message: &str) {
        self.state.lock().fail_read = Some(message.to_string());
    }

    /// Clears a previous read failure injection.
    pub fn clear_fail_read(&self) {
        self.state.lock().fail_read = None;
    }

    /// Returns every chunk written so far.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().writes.clone()
    }

    /// Returns everything written so far as one lossily-decoded string.
    pub fn written_text(&self) -> String {
        let state = self.state.lock();
        let mut text = String::new();
        for chunk in &state.writes {
            text.push_str(&String::from_utf8_lossy(chunk));
        }
        text
    }

    /// Number of times `open` was called.
    pub fn open_count(&self) -> usize {
        self.state.lock().open_count
    }

    /// Number of times `close` was called on an open transport.
    pub fn close_count(&self) -> usize {
        self.state.lock().close_count
    }

    /// Number of scripted read chunks not yet consumed.
    pub fn pending_reads(&self) -> usize {
        self.state.lock().reads.len()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.open_count += 1;
        if let Some(message) = &state.fail_open {
            return Err(Error::TransportFailure(message.clone()));
        }
        state.open = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        if state.open {
            state.close_count += 1;
        }
        state.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    async fn read(&mut self, size: usize, timeout: Duration) -> Result<Bytes> {
        let chunk = {
            let mut state = self.state.lock();
            if !state.open {
                return Err(Error::TransportFailure("mock transport is not open".into()));
            }
            if let Some(message) = &state.fail_read {
                return Err(Error::TransportFailure(message.clone()));
            }
            state.reads.pop_front()
        };
        match chunk {
            Some(mut data) => {
                if data.len() > size {
                    let rest = data.split_off(size);
                    self.state.lock().reads.push_front(rest);
                }
                Ok(data)
            }
            None => {
                // Simulate a quiet device: block for the read timeout.
                sleep(timeout).await;
                Ok(Bytes::new())
            }
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(Error::TransportFailure("mock transport is not open".into()));
        }
        state.writes.push(data.to_vec());
        if let Some(reply) = state.replies.pop_front().flatten() {
            state.reads.push_back(reply);
        }
        Ok(data.len())
    }

    fn get_property(&self, key: &str) -> Option<Value> {
        self.state.lock().props.get(key).cloned()
    }

    fn set_property(&mut self, key: &str, value: Value) -> Result<()> {
        self.state.lock().props.set(key, value);
        Ok(())
    }

    async fn flush_buffers(&mut self) -> Result<()> {
        self.state.lock().reads.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_transport_scripted_reads() {
        let mock = MockTransport::new();
        let mut transport = mock.clone();
        transport.open().await.unwrap();
        mock.enqueue_reads(["hello ", "world\n"]);
        let first = transport.read(64, Duration::from_millis(1)).await.unwrap();
        assert_eq!(&first[..], b"hello ");
        let second = transport.read(64, Duration::from_millis(1)).await.unwrap();
        assert_eq!(&second[..], b"world\n");
        let empty = transport.read(64, Duration::from_millis(1)).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_mock_transport_read_honors_size() {
        let mock = MockTransport::new();
        let mut transport = mock.clone();
        transport.open().await.unwrap();
        mock.enqueue_read("abcdef");
        let first = transport.read(4, Duration::from_millis(1)).await.unwrap();
        assert_eq!(&first[..], b"abcd");
        let second = transport.read(4, Duration::from_millis(1)).await.unwrap();
        assert_eq!(&second[..], b"ef");
    }

    #[tokio::test]
    async fn test_mock_transport_scripted_replies() {
        let mock = MockTransport::new();
        let mut transport = mock.clone();
        transport.open().await.unwrap();
        mock.script_reply(None);
        mock.script_reply(Some(Bytes::from_static(b"OK\n")));
        transport.write(b"ping\n").await.unwrap();
        assert_eq!(mock.pending_reads(), 0);
        transport.write(b"ping\n").await.unwrap();
        assert_eq!(mock.pending_reads(), 1);
        assert_eq!(mock.written_text(), "ping\nping\n");
    }

    #[tokio::test]
    async fn test_mock_transport_open_close_counts() {
        let mock = MockTransport::new();
        let mut transport = mock.clone();
        transport.open().await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert_eq!(mock.open_count(), 1);
        assert_eq!(mock.close_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_transport_fail_open() {
        let mock = MockTransport::new();
        let mut transport = mock.clone();
        mock.fail_open("no device");
        assert!(transport.open().await.is_err());
        assert!(!transport.is_open());
    }
}
