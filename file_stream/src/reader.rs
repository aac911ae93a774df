//! Chunked reader: byte-offset construction, range reads, node chaining.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use disc_client::{Node, Rest};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;

use crate::error::{Result, StreamError};
use crate::ChunkRead;

type BodyReader = StreamReader<BoxStream<'static, std::io::Result<Bytes>>, Bytes>;

/// Reads a file's bytes from `pos` onward by streaming through its node
/// list, opening each node with a range request and chaining onto the
/// next at end of chunk. Seeking means building a new reader at the new
/// position.
pub struct ChunkReader {
    rest: Arc<Rest>,
    nodes: Vec<Node>,
    cur: usize,
    pos: u64,
    current: Option<BodyReader>,
    closed: bool,
}

impl std::fmt::Debug for ChunkReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkReader")
            .field("rest", &self.rest)
            .field("nodes", &self.nodes)
            .field("cur", &self.cur)
            .field("pos", &self.pos)
            .field("current", &self.current.is_some())
            .field("closed", &self.closed)
            .finish()
    }
}

impl ChunkReader {
    /// Assigns each node its byte span, validates `pos` against the total
    /// size and drops the nodes entirely before `pos`. The first range
    /// request is deferred until the first read.
    pub fn new(rest: Arc<Rest>, mut nodes: Vec<Node>, pos: u64) -> Result<Self> {
        // Zero-size nodes carry no bytes and would produce degenerate
        // range requests.
        nodes.retain(|node| node.size > 0);

        let mut offset = 0u64;
        for node in &mut nodes {
            node.start = offset;
            node.end = offset + node.size as u64 - 1;
            offset = node.end + 1;
        }
        if pos > offset {
            return Err(StreamError::OutOfRange { pos, size: offset });
        }

        let covering = nodes
            .iter()
            .position(|node| node.end >= pos)
            .unwrap_or(nodes.len());
        nodes.drain(..covering);

        Ok(Self {
            rest,
            nodes,
            cur: 0,
            pos,
            current: None,
            closed: false,
        })
    }

    /// Fills `buf` from the node chain. Returns `Ok(0)` once the last
    /// node is exhausted.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.closed {
            return Err(StreamError::Closed);
        }
        if self.cur >= self.nodes.len() {
            return Ok(0);
        }
        if self.current.is_none() {
            self.open_current().await?;
        }

        let mut total = 0;
        while total < buf.len() {
            let Some(reader) = self.current.as_mut() else {
                break;
            };
            let n = reader.read(&mut buf[total..]).await?;
            total += n;
            if n == 0 {
                self.current = None;
                self.cur += 1;
                if self.cur >= self.nodes.len() {
                    break;
                }
                self.open_current().await?;
            }
        }
        Ok(total)
    }

    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(StreamError::AlreadyClosed);
        }
        self.closed = true;
        self.current = None;
        Ok(())
    }

    async fn open_current(&mut self) -> Result<()> {
        let node = &self.nodes[self.cur];
        // Only the covering first node can start mid-chunk.
        let start = self.pos.saturating_sub(node.start);
        let resp = self.rest.read_attachment(node, start, node.size as u64 - 1).await?;
        let stream = resp
            .bytes_stream()
            .map_err(std::io::Error::other)
            .boxed();
        self.current = Some(StreamReader::new(stream));
        Ok(())
    }
}

#[async_trait]
impl ChunkRead for ChunkReader {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        ChunkReader::read(self, buf).await
    }

    async fn close(&mut self) -> Result<()> {
        ChunkReader::close(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(size: u32) -> Node {
        Node {
            message_id: 1,
            url: "https://cdn.discordapp.com/attachments/7/900/f.bin".to_string(),
            size,
            expiry: u32::MAX,
            issued: 1,
            signature: "aa".to_string(),
            start: 0,
            end: 0,
        }
    }

    fn rest() -> Arc<Rest> {
        Arc::new(Rest::new("http://127.0.0.1:9", vec!["t".into()], vec!["c".into()], 16, false).unwrap())
    }

    #[test]
    fn spans_are_prefix_sums() {
        let reader = ChunkReader::new(rest(), vec![node(10), node(10), node(5)], 0).unwrap();
        let spans: Vec<(u64, u64)> = reader.nodes.iter().map(|n| (n.start, n.end)).collect();
        assert_eq!(spans, vec![(0, 9), (10, 19), (20, 24)]);
    }

    #[test]
    fn nodes_before_pos_are_dropped() {
        let reader = ChunkReader::new(rest(), vec![node(10), node(10), node(5)], 12).unwrap();
        assert_eq!(reader.nodes.len(), 2);
        assert_eq!(reader.nodes[0].start, 10);
    }

    #[test]
    fn pos_past_the_end_is_rejected() {
        let err = ChunkReader::new(rest(), vec![node(10)], 11).unwrap_err();
        assert!(matches!(err, StreamError::OutOfRange { pos: 11, size: 10 }));
    }

    #[tokio::test]
    async fn pos_at_the_end_reads_eof() {
        let mut reader = ChunkReader::new(rest(), vec![node(10)], 10).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn empty_node_list_reads_eof() {
        let mut reader = ChunkReader::new(rest(), vec![], 0).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn zero_size_nodes_are_ignored() {
        let mut reader = ChunkReader::new(rest(), vec![node(0), node(0)], 0).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn read_after_close_is_rejected() {
        let mut reader = ChunkReader::new(rest(), vec![node(10)], 0).unwrap();
        reader.close().await.unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(reader.read(&mut buf).await, Err(StreamError::Closed)));
        assert!(matches!(reader.close().await, Err(StreamError::AlreadyClosed)));
    }
}
