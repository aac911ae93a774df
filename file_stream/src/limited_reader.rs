//! A reader wrapper that stops after a byte budget.

use async_trait::async_trait;

use crate::error::Result;
use crate::ChunkRead;

/// Yields at most `limit` bytes from the wrapped source, then reports end
/// of stream and closes the source. Front-ends use this to bound range
/// responses to the requested length.
pub struct LimitedReader<R> {
    source: Option<R>,
    remaining: u64,
}

impl<R: ChunkRead> LimitedReader<R> {
    pub fn new(source: R, limit: u64) -> Self {
        Self {
            source: Some(source),
            remaining: limit,
        }
    }
}

#[async_trait]
impl<R: ChunkRead> ChunkRead for LimitedReader<R> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.remaining == 0 {
            if let Some(mut source) = self.source.take() {
                let _ = source.close().await;
            }
            return Ok(0);
        }
        let Some(source) = self.source.as_mut() else {
            return Ok(0);
        };

        let cap = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let n = source.read(&mut buf[..cap]).await?;
        self.remaining -= n as u64;

        if n == 0 || self.remaining == 0 {
            self.remaining = 0;
            if let Some(mut source) = self.source.take() {
                let _ = source.close().await;
            }
        }
        Ok(n)
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut source) = self.source.take() {
            source.close().await?;
        }
        Ok(())
    }
}
