//! Pause/resume gate layered on top of a [`RingBuffer`] reader.
//!
//! While a producer skips unwanted data it pauses the gate. A reader that
//! runs dry during the pause waits on the gate instead of reporting a
//! timeout, so consumers never see a premature end of stream.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tracing::trace;

use crate::buffer::{BufferError, RingBuffer};
use crate::error::StreamError;

/// Binary gate, open by default.
#[derive(Debug)]
pub struct FilterGate {
    open: watch::Sender<bool>,
}

impl FilterGate {
    pub fn new() -> Self {
        let (open, _) = watch::channel(true);
        Self { open }
    }

    pub fn pause(&self) {
        if self.open.send_replace(false) {
            trace!("Filter gate paused");
        }
    }

    pub fn resume(&self) {
        if !self.open.send_replace(true) {
            trace!("Filter gate resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        !*self.open.borrow()
    }

    /// Wait until the gate is open.
    pub async fn wait(&self) {
        let mut rx = self.open.subscribe();
        // The sender lives in `self`, so this only returns once the gate opens.
        let _ = rx.wait_for(|open| *open).await;
    }

    /// Wait until the gate is open, returning false if `timeout` elapses first.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}

impl Default for FilterGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Reader over a ring buffer that honours a [`FilterGate`].
#[derive(Debug, Clone)]
pub struct FilteredReader {
    buffer: Arc<RingBuffer>,
    gate: Arc<FilterGate>,
    timeout: Option<Duration>,
}

impl FilteredReader {
    pub fn new(buffer: Arc<RingBuffer>, gate: Arc<FilterGate>, timeout: Option<Duration>) -> Self {
        Self {
            buffer,
            gate,
            timeout,
        }
    }

    pub fn buffer(&self) -> &Arc<RingBuffer> {
        &self.buffer
    }

    pub fn gate(&self) -> &Arc<FilterGate> {
        &self.gate
    }

    pub fn pause(&self) {
        self.gate.pause();
    }

    pub fn resume(&self) {
        self.gate.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.gate.is_paused()
    }

    pub async fn filter_wait(&self, timeout: Duration) -> bool {
        self.gate.wait_timeout(timeout).await
    }

    /// Read up to `n` bytes; empty bytes mean end of stream.
    pub async fn read(&self, n: usize) -> Result<Bytes, StreamError> {
        loop {
            match self.buffer.read(n, true, self.timeout).await {
                Ok(chunk) => return Ok(chunk),
                Err(BufferError::TimedOut | BufferError::WouldBlock) => {
                    tokio::select! {
                        _ = self.gate.wait() => {}
                        _ = self.buffer.closed() => {}
                    }
                    if self.buffer.is_closed() {
                        // Drain anything written before close.
                        return self
                            .buffer
                            .read(n, false, None)
                            .await
                            .or(Ok(Bytes::new()));
                    }
                    if !self.buffer.is_empty() {
                        continue;
                    }
                    return Err(StreamError::ReadTimeout);
                }
            }
        }
    }

    /// Close the buffer and release any reader blocked on the gate.
    pub fn close(&self) {
        self.gate.resume();
        self.buffer.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn reader(capacity: usize, timeout: Duration) -> FilteredReader {
        FilteredReader::new(
            Arc::new(RingBuffer::new(capacity)),
            Arc::new(FilterGate::new()),
            Some(timeout),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_surfaces_when_not_paused() {
        let reader = reader(16, Duration::from_secs(1));
        assert!(matches!(reader.read(4).await, Err(StreamError::ReadTimeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn paused_reader_waits_for_resume() {
        let reader = reader(16, Duration::from_secs(1));
        reader.pause();
        assert!(reader.is_paused());

        let producer = {
            let reader = reader.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                reader.buffer().write(b"after-ad").await;
                reader.resume();
            })
        };

        let out = reader.read(16).await.unwrap();
        assert_eq!(&out[..], b"after-ad");
        producer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn close_while_paused_returns_empty() {
        let reader = reader(16, Duration::from_secs(1));
        reader.pause();
        let closer = {
            let reader = reader.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                reader.buffer().close();
            })
        };
        assert!(reader.read(4).await.unwrap().is_empty());
        closer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn filter_wait_times_out_while_paused() {
        let reader = reader(4, Duration::from_secs(1));
        reader.pause();
        assert!(!reader.filter_wait(Duration::from_secs(2)).await);
        reader.resume();
        assert!(reader.filter_wait(Duration::from_secs(2)).await);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        /// Pausing around writes never loses or reorders bytes.
        #[test]
        fn prop_pause_resume_no_loss(
            ops in prop::collection::vec((prop::collection::vec(any::<u8>(), 0..32), any::<bool>()), 0..16),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .start_paused(true)
                .build()
                .unwrap();
            let expected: Vec<u8> = ops.iter().flat_map(|(d, _)| d.clone()).collect();
            let out = rt.block_on(async move {
                let reader = reader(64, Duration::from_millis(100));
                let producer = {
                    let reader = reader.clone();
                    tokio::spawn(async move {
                        for (data, pause) in ops {
                            if pause {
                                reader.pause();
                                tokio::time::sleep(Duration::from_millis(500)).await;
                            }
                            reader.buffer().write(&data).await;
                            reader.resume();
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                        reader.buffer().close();
                    })
                };
                let mut out = Vec::new();
                loop {
                    match reader.read(7).await {
                        Ok(chunk) if chunk.is_empty() => break,
                        Ok(chunk) => out.extend_from_slice(&chunk),
                        Err(StreamError::ReadTimeout) => continue,
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
                producer.await.unwrap();
                out
            });
            prop_assert_eq!(out, expected);
        }
    }
}
