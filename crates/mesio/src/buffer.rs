//! Bounded byte FIFO coupling one producer to one consumer.
//!
//! Writers block while the buffer is full, readers block while it is empty.
//! After [`RingBuffer::close`] reads drain whatever is left and then return
//! empty bytes; writes return without storing anything.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default capacity, 16 MiB.
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("timed out waiting for data")]
    TimedOut,
    #[error("no data available")]
    WouldBlock,
}

#[derive(Debug)]
struct Inner {
    data: BytesMut,
    closed: bool,
}

#[derive(Debug)]
pub struct RingBuffer {
    inner: Mutex<Inner>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
    closed: CancellationToken,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                data: BytesMut::with_capacity(capacity.min(DEFAULT_BUFFER_SIZE)),
                closed: false,
            }),
            capacity,
            not_empty: Notify::new(),
            not_full: Notify::new(),
            closed: CancellationToken::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.inner.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Space left before writers block.
    pub fn free(&self) -> usize {
        self.capacity - self.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Resolves once the buffer has been closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Token cancelled on close, for tasks that only need the signal.
    pub fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Append `data`, waiting for space as needed.
    ///
    /// Returns the number of bytes stored, which is short of `data.len()` only
    /// if the buffer was closed while waiting.
    pub async fn write(&self, mut data: &[u8]) -> usize {
        let mut written = 0;
        while !data.is_empty() {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return written;
                }
                let free = self.capacity - inner.data.len();
                if free > 0 {
                    let n = free.min(data.len());
                    inner.data.extend_from_slice(&data[..n]);
                    drop(inner);
                    data = &data[n..];
                    written += n;
                    self.not_empty.notify_waiters();
                    continue;
                }
            }

            notified.await;
        }
        written
    }

    /// Return up to `n` bytes.
    ///
    /// With `block` set and nothing buffered, waits for data or close, failing
    /// with [`BufferError::TimedOut`] once `timeout` elapses. Empty bytes mean
    /// the buffer is closed and drained.
    pub async fn read(
        &self,
        n: usize,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<Bytes, BufferError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut timed_out = false;

        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if !inner.data.is_empty() {
                    let take = n.min(inner.data.len());
                    let chunk = inner.data.split_to(take).freeze();
                    drop(inner);
                    self.not_full.notify_waiters();
                    return Ok(chunk);
                }
                if inner.closed || n == 0 {
                    return Ok(Bytes::new());
                }
            }

            if !block {
                return Err(BufferError::WouldBlock);
            }
            if timed_out {
                return Err(BufferError::TimedOut);
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        timed_out = true;
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Close the buffer and wake every waiter. Idempotent.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
        }
        self.closed.cancel();
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}
