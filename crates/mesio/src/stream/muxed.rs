use async_trait::async_trait;
use tracing::{debug, warn};

use super::{BoxReader, Stream, StreamContext, StreamDescriptor, StreamRef};
use crate::error::StreamError;

/// External collaborator combining several readers into one container.
#[async_trait]
pub trait Muxer: Send + Sync {
    async fn mux(&self, inputs: Vec<BoxReader>) -> Result<BoxReader, StreamError>;
}

/// Several substreams (e.g. video and an alternative audio rendition) muxed together.
#[derive(Debug, Clone)]
pub struct MuxedStream {
    ctx: StreamContext,
    substreams: Vec<StreamRef>,
}

impl MuxedStream {
    pub fn new(ctx: StreamContext, substreams: Vec<StreamRef>) -> Self {
        Self { ctx, substreams }
    }

    pub fn substreams(&self) -> &[StreamRef] {
        &self.substreams
    }
}

#[async_trait]
impl Stream for MuxedStream {
    fn shortname(&self) -> &'static str {
        "muxed"
    }

    async fn open(&self) -> Result<BoxReader, StreamError> {
        let Some(muxer) = self.ctx.muxer() else {
            return Err(StreamError::unsupported("no muxer configured"));
        };

        let mut readers = Vec::with_capacity(self.substreams.len());
        for stream in &self.substreams {
            match stream.open().await {
                Ok(reader) => readers.push(reader),
                Err(e) => {
                    warn!(shortname = stream.shortname(), error = %e, "Failed to open substream");
                    for mut reader in readers {
                        reader.close().await;
                    }
                    return Err(e);
                }
            }
        }
        debug!(count = readers.len(), "Muxing substreams");
        muxer.mux(readers).await
    }

    fn descriptor(&self) -> StreamDescriptor {
        StreamDescriptor::Muxed {
            substreams: self.substreams.iter().map(|s| s.descriptor()).collect(),
        }
    }
}
