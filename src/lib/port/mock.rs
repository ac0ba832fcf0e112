//! Scripted in-memory device for driver and pipeline tests.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use super::Transport;
use crate::lock;

const READ_TIMEOUT: Duration = Duration::from_millis(5);

/// Maps every write to an optional device answer.
pub(crate) type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

/// Clones share the same device, like two fds on one tty.
#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    readable: Condvar,
}

#[derive(Default)]
struct State {
    rx: VecDeque<Vec<u8>>,
    failures: VecDeque<io::ErrorKind>,
    writes: Vec<Vec<u8>>,
    min_read: u8,
    responder: Option<Responder>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_responder<F>(responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        let mock = Self::new();
        lock(&mock.inner.state).responder = Some(Box::new(responder));
        mock
    }

    /// Queues one chunk; each chunk is returned by a separate read.
    pub(crate) fn feed(&self, bytes: &[u8]) {
        lock(&self.inner.state).rx.push_back(bytes.to_vec());
        self.inner.readable.notify_all();
    }

    /// Makes the next read fail with `kind` before any queued data.
    pub(crate) fn fail_next_read(&self, kind: io::ErrorKind) {
        lock(&self.inner.state).failures.push_back(kind);
        self.inner.readable.notify_all();
    }

    pub(crate) fn failures_left(&self) -> usize {
        lock(&self.inner.state).failures.len()
    }

    pub(crate) fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.inner.state).writes.clone()
    }

    pub(crate) fn written(&self, bytes: &[u8]) -> usize {
        lock(&self.inner.state)
            .writes
            .iter()
            .filter(|w| w.as_slice() == bytes)
            .count()
    }

    pub(crate) fn min_read(&self) -> u8 {
        lock(&self.inner.state).min_read
    }

    /// Waits until the reader consumed every queued chunk.
    pub(crate) fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if lock(&self.inner.state).rx.is_empty() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }
}

impl Read for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = lock(&self.inner.state);
        if let Some(kind) = state.failures.pop_front() {
            return Err(kind.into());
        }
        if state.rx.is_empty() {
            state = match self.inner.readable.wait_timeout(state, READ_TIMEOUT) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }

        let mut chunk = match state.rx.pop_front() {
            Some(chunk) => chunk,
            None => return Err(io::ErrorKind::TimedOut.into()),
        };

        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            state.rx.push_front(chunk.split_off(n));
        }
        Ok(n)
    }
}

impl Write for MockTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = lock(&self.inner.state);
        state.writes.push(buf.to_vec());

        let answer = state.responder.as_mut().and_then(|respond| respond(buf));
        if let Some(answer) = answer {
            state.rx.push_back(answer);
            self.inner.readable.notify_all();
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for MockTransport {
    fn set_min_read(&mut self, len: u8) -> io::Result<()> {
        lock(&self.inner.state).min_read = len;
        Ok(())
    }

    fn try_clone_transport(&self) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new(self.clone()))
    }
}
