//! Generic segmented-stream pipeline.
//!
//! A [`SegmentedWorker`] discovers segments and puts them on a bounded
//! [`SegmentQueue`]. The writer task pulls them, fans fetches out to at most
//! `threads` spawned tasks, and writes results into the ring buffer in queue
//! order. The consumer reads through a [`FilteredReader`], so segments the
//! [`SegmentProcessor`] filters out pause the reader instead of ending it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::FuturesOrdered;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, trace, warn};

use crate::buffer::RingBuffer;
use crate::error::StreamError;
use crate::filtered::{FilterGate, FilteredReader};
use crate::stream::StreamReader;

/// Bounded hand-off from the worker to the writer.
pub struct SegmentQueue<S> {
    tx: mpsc::Sender<S>,
    cancel: CancellationToken,
}

impl<S: Send> SegmentQueue<S> {
    /// Enqueue `segment`, waiting while the queue is full.
    ///
    /// Returns false once the pipeline is shutting down.
    pub async fn put(&self, segment: S) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(segment) => sent.is_ok(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    #[cfg(test)]
    pub(crate) fn for_tests(tx: mpsc::Sender<S>, cancel: CancellationToken) -> Self {
        Self { tx, cancel }
    }
}

/// Segment discovery side of the pipeline.
#[async_trait]
pub trait SegmentedWorker: Send + 'static {
    type Segment: Send + 'static;

    /// Produce segments until the source ends or `cancel` fires.
    ///
    /// Returning `Ok` ends the stream cleanly once queued segments are
    /// written; an error is surfaced to the reader.
    async fn run(
        &mut self,
        queue: &SegmentQueue<Self::Segment>,
        cancel: &CancellationToken,
    ) -> Result<(), StreamError>;
}

/// Fetch and write side of the pipeline.
#[async_trait]
pub trait SegmentProcessor: Send + Sync + 'static {
    type Segment: Send + Sync + 'static;
    type Output: Send + 'static;

    /// Segments for which this returns true are skipped and pause the reader.
    fn should_filter(&self, _segment: &Self::Segment) -> bool {
        false
    }

    /// Fetch one segment. `None` drops it; the implementation logs why.
    ///
    /// Runs concurrently with other fetches.
    async fn fetch(&self, segment: &Self::Segment, cancel: &CancellationToken) -> Option<Self::Output>;

    /// Write a fetched segment. Called from a single task, in queue order.
    async fn write(
        &self,
        segment: &Self::Segment,
        output: Self::Output,
        buffer: &RingBuffer,
    ) -> Result<(), StreamError>;
}

#[derive(Debug, Clone)]
pub struct SegmentedConfig {
    /// Parallel fetch width.
    pub threads: usize,
    pub buffer_size: usize,
    /// Read-side timeout, `None` waits forever.
    pub timeout: Option<Duration>,
}

enum Completed<S, O> {
    Filtered(S),
    Fetched(S, Option<O>),
}

type ErrorSlot = Arc<Mutex<Option<StreamError>>>;

/// Start the pipeline and return its reader.
pub fn spawn<W, P>(worker: W, processor: P, config: SegmentedConfig) -> SegmentedReader
where
    W: SegmentedWorker,
    P: SegmentProcessor<Segment = W::Segment>,
{
    let threads = config.threads.max(1);
    let buffer = Arc::new(RingBuffer::new(config.buffer_size));
    let gate = Arc::new(FilterGate::new());
    let reader = FilteredReader::new(buffer.clone(), gate.clone(), config.timeout);
    let error: ErrorSlot = Arc::new(Mutex::new(None));

    // Closing the buffer from the reader side stops both tasks.
    let cancel = buffer.close_token().child_token();

    let (tx, rx) = mpsc::channel(threads * 2);
    let queue = SegmentQueue {
        tx,
        cancel: cancel.clone(),
    };

    let task = tokio::spawn(run_pipeline(
        worker,
        Arc::new(processor),
        queue,
        rx,
        buffer,
        gate,
        threads,
        cancel.clone(),
        error.clone(),
    ));

    SegmentedReader {
        reader,
        error,
        cancel,
        task: Some(AbortOnDropHandle::new(task)),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_pipeline<W, P>(
    mut worker: W,
    processor: Arc<P>,
    queue: SegmentQueue<W::Segment>,
    rx: mpsc::Receiver<W::Segment>,
    buffer: Arc<RingBuffer>,
    gate: Arc<FilterGate>,
    threads: usize,
    cancel: CancellationToken,
    error: ErrorSlot,
) where
    W: SegmentedWorker,
    P: SegmentProcessor<Segment = W::Segment>,
{
    let writer: JoinHandle<()> = tokio::spawn(run_writer(
        processor,
        rx,
        buffer.clone(),
        gate.clone(),
        threads,
        cancel.clone(),
    ));
    let writer = AbortOnDropHandle::new(writer);

    debug!("Segmented worker started");
    let result = worker.run(&queue, &cancel).await;
    // Dropping the queue lets the writer drain and finish.
    drop(queue);

    match result {
        Ok(()) => debug!("Segmented worker finished"),
        Err(StreamError::Closed) => debug!("Segmented worker stopped by close"),
        Err(e) => {
            error!(error = %e, "Segmented worker failed");
            *error.lock() = Some(e);
            cancel.cancel();
        }
    }

    if let Err(e) = writer.await
        && !e.is_cancelled()
    {
        error!(error = %e, "Segment writer task panicked");
    }
    gate.resume();
    buffer.close();
}

async fn run_writer<P: SegmentProcessor>(
    processor: Arc<P>,
    mut rx: mpsc::Receiver<P::Segment>,
    buffer: Arc<RingBuffer>,
    gate: Arc<FilterGate>,
    threads: usize,
    cancel: CancellationToken,
) {
    let mut pending: FuturesOrdered<BoxFuture<'static, Option<Completed<P::Segment, P::Output>>>> =
        FuturesOrdered::new();
    let mut input_closed = false;

    loop {
        if input_closed && pending.is_empty() {
            break;
        }
        let can_accept = !input_closed && pending.len() < threads;

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("Segment writer cancelled");
                break;
            }

            completed = pending.next(), if !pending.is_empty() => {
                let Some(Some(completed)) = completed else {
                    continue;
                };
                match completed {
                    Completed::Filtered(_) => {
                        if !gate.is_paused() {
                            info!("Filtering out segments and pausing stream output");
                            gate.pause();
                        }
                    }
                    Completed::Fetched(_, None) => {}
                    Completed::Fetched(segment, Some(output)) => {
                        match processor.write(&segment, output, &buffer).await {
                            Ok(()) => {}
                            Err(StreamError::Closed) => {
                                debug!("Output closed while writing segment");
                                break;
                            }
                            Err(e) => {
                                warn!(error = %e, "Failed to write segment, skipping");
                                continue;
                            }
                        }
                        if gate.is_paused() {
                            info!("Resuming stream output");
                            gate.resume();
                        }
                    }
                }
            }

            segment = rx.recv(), if can_accept => {
                let Some(segment) = segment else {
                    trace!("Segment queue closed, draining");
                    input_closed = true;
                    continue;
                };
                if processor.should_filter(&segment) {
                    pending.push_back(futures::future::ready(Some(Completed::Filtered(segment))).boxed());
                    continue;
                }

                let processor = processor.clone();
                let token = cancel.clone();
                let handle = AbortOnDropHandle::new(tokio::spawn(async move {
                    let output = processor.fetch(&segment, &token).await;
                    (segment, output)
                }));
                pending.push_back(
                    async move {
                        match handle.await {
                            Ok((segment, output)) => Some(Completed::Fetched(segment, output)),
                            Err(e) => {
                                warn!(error = %e, "Segment fetch task failed");
                                None
                            }
                        }
                    }
                    .boxed(),
                );
            }
        }
    }

    buffer.close();
}

/// Reader of a running pipeline.
pub struct SegmentedReader {
    reader: FilteredReader,
    error: ErrorSlot,
    cancel: CancellationToken,
    task: Option<AbortOnDropHandle<()>>,
}

impl SegmentedReader {
    pub fn filtered(&self) -> &FilteredReader {
        &self.reader
    }
}

#[async_trait]
impl StreamReader for SegmentedReader {
    async fn read(&mut self, n: usize) -> Result<Bytes, StreamError> {
        let chunk = self.reader.read(n).await?;
        if chunk.is_empty()
            && let Some(e) = self.error.lock().take()
        {
            return Err(e);
        }
        Ok(chunk)
    }

    async fn close(&mut self) {
        self.cancel.cancel();
        self.reader.close();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SegmentedReader {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.reader.close();
    }
}
