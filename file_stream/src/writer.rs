//! Sequential chunk writer: one upload in flight, chunks committed in
//! byte order.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use disc_client::{Node, Rest};
use reqwest::Body;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::error::{Result, StreamError};
use crate::ChunkWrite;

/// Invoked once per committed chunk, in byte order.
pub type OnChunk = Box<dyn FnMut(Node) + Send>;

/// Frames buffered between the caller and the in-flight upload body.
const FRAME_BUFFER: usize = 8;

/// Streams bytes to the service one `chunk_size`-bounded attachment at a
/// time. Bytes written while a chunk is open are fed straight into the
/// upload's request body through a frame channel; crossing a chunk
/// boundary closes the body, waits for the committed node and hands it to
/// the `on_chunk` callback before the next chunk starts.
pub struct ChunkWriter {
    rest: Arc<Rest>,
    chunk_size: usize,
    on_chunk: OnChunk,
    /// Bytes already written into the current chunk.
    idx: usize,
    closed: bool,
    current: Option<InFlight>,
}

struct InFlight {
    frames: mpsc::Sender<io::Result<Bytes>>,
    upload: JoinHandle<disc_client::Result<Node>>,
}

impl ChunkWriter {
    pub fn new(rest: Arc<Rest>, chunk_size: usize, on_chunk: OnChunk) -> Self {
        Self {
            rest,
            chunk_size,
            on_chunk,
            idx: 0,
            closed: false,
            current: None,
        }
    }

    /// Writes `buf`, splitting it across chunk boundaries as needed.
    /// Blocks while a boundary flush waits for the in-flight upload.
    pub async fn write(&mut self, mut buf: &[u8]) -> Result<usize> {
        if self.closed {
            return Err(StreamError::Closed);
        }
        if self.current.is_none() {
            self.start_chunk();
        }
        let total = buf.len();
        while !buf.is_empty() {
            if self.current.is_none() {
                self.start_chunk();
            }
            let take = buf.len().min(self.chunk_size - self.idx);
            self.push(&buf[..take]).await?;
            self.idx += take;
            buf = &buf[take..];
            if self.idx == self.chunk_size {
                self.flush().await?;
            }
        }
        Ok(total)
    }

    /// Commits the pending chunk, if any. A second close returns
    /// [`StreamError::AlreadyClosed`].
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(StreamError::AlreadyClosed);
        }
        self.closed = true;
        self.flush().await
    }

    fn start_chunk(&mut self) {
        let (frames, rx) = mpsc::channel::<io::Result<Bytes>>(FRAME_BUFFER);
        let rest = self.rest.clone();
        let upload = tokio::spawn(async move {
            rest.create_attachment(Body::wrap_stream(ReceiverStream::new(rx)))
                .await
        });
        self.current = Some(InFlight { frames, upload });
        self.idx = 0;
    }

    async fn push(&mut self, data: &[u8]) -> Result<()> {
        let frames = match &self.current {
            Some(chunk) => chunk.frames.clone(),
            None => return Err(StreamError::Closed),
        };
        if frames.send(Ok(Bytes::copy_from_slice(data))).await.is_err() {
            // The uploader dropped the body mid-chunk: it failed.
            return Err(self.take_upload_error().await);
        }
        Ok(())
    }

    /// Closes the current request body, waits for the committed node and
    /// fires the callback.
    async fn flush(&mut self) -> Result<()> {
        let Some(InFlight { frames, upload }) = self.current.take() else {
            return Ok(());
        };
        drop(frames);
        let node = upload.await??;
        debug!(message_id = node.message_id, size = node.size, "chunk committed");
        (self.on_chunk)(node);
        self.idx = 0;
        Ok(())
    }

    async fn take_upload_error(&mut self) -> StreamError {
        let Some(InFlight { frames, upload }) = self.current.take() else {
            return StreamError::Task("upload task missing".to_string());
        };
        drop(frames);
        match upload.await {
            Ok(Ok(_)) => StreamError::Task("upload ended before the chunk was fully written".to_string()),
            Ok(Err(err)) => err.into(),
            Err(join) => join.into(),
        }
    }
}

#[async_trait]
impl ChunkWrite for ChunkWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        ChunkWriter::write(self, buf).await
    }

    async fn close(&mut self) -> Result<()> {
        ChunkWriter::close(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer_with_no_server() -> ChunkWriter {
        let rest = Arc::new(
            Rest::new("http://127.0.0.1:9", vec!["t".into()], vec!["c".into()], 16, false).unwrap(),
        );
        ChunkWriter::new(rest, 16, Box::new(|_| {}))
    }

    #[tokio::test]
    async fn close_without_writes_is_ok_once() {
        let mut writer = writer_with_no_server();
        writer.close().await.unwrap();
        assert!(matches!(writer.close().await, Err(StreamError::AlreadyClosed)));
    }

    #[tokio::test]
    async fn write_after_close_is_rejected() {
        let mut writer = writer_with_no_server();
        writer.close().await.unwrap();
        assert!(matches!(writer.write(b"data").await, Err(StreamError::Closed)));
    }

    #[tokio::test]
    async fn failed_upload_surfaces_on_flush() {
        // Nothing listens on this port, so the upload task fails with a
        // transport error once the chunk is flushed.
        let mut writer = writer_with_no_server();
        writer.write(b"0123456789abcdef").await.unwrap_err();
    }
}
