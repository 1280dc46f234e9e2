use std::path::PathBuf;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::debug;

use super::{BoxReader, Stream, StreamDescriptor, StreamReader};
use crate::error::StreamError;

/// Local file.
#[derive(Debug, Clone)]
pub struct FileStream {
    path: PathBuf,
}

impl FileStream {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl Stream for FileStream {
    fn shortname(&self) -> &'static str {
        "file"
    }

    async fn open(&self) -> Result<BoxReader, StreamError> {
        let file = File::open(&self.path).await?;
        debug!(path = %self.path.display(), "Opened file stream");
        Ok(Box::new(FileReader { file: Some(file) }))
    }

    fn descriptor(&self) -> StreamDescriptor {
        StreamDescriptor::File {
            path: self.path.clone(),
        }
    }
}

struct FileReader {
    file: Option<File>,
}

#[async_trait]
impl StreamReader for FileReader {
    async fn read(&mut self, n: usize) -> Result<Bytes, StreamError> {
        let Some(file) = self.file.as_mut() else {
            return Ok(Bytes::new());
        };
        let mut buf = BytesMut::zeroed(n);
        let read = file.read(&mut buf).await?;
        buf.truncate(read);
        Ok(buf.freeze())
    }

    async fn close(&mut self) {
        self.file = None;
    }
}
