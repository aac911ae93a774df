//! Chunked byte streams over remotely stored attachments.
//!
//! Writers turn a byte stream into an ordered sequence of size-bounded
//! attachment uploads; the reader turns such a sequence back into a
//! seekable byte stream using range requests.

use async_trait::async_trait;

pub use error::{Result, StreamError};
pub use limited_reader::LimitedReader;
pub use parallel_writer::ParallelChunkWriter;
pub use reader::ChunkReader;
pub use writer::{ChunkWriter, OnChunk};

mod error;
mod limited_reader;
mod parallel_writer;
mod reader;
mod writer;

/// Byte-sink seam in front of the chunk writers.
#[async_trait]
pub trait ChunkWrite: Send {
    /// Writes the whole buffer, splitting it across chunks as needed.
    async fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Commits any partial chunk and waits for outstanding uploads.
    async fn close(&mut self) -> Result<()>;
}

/// Byte-source seam in front of the chunk reader.
#[async_trait]
pub trait ChunkRead: Send {
    /// Fills `buf` with the next bytes of the stream; `Ok(0)` is end of
    /// stream.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    async fn close(&mut self) -> Result<()>;
}
