//! Engine facade: validates the driver configuration, clamps the chunk
//! size to the token tier and hands out writers, readers and the node
//! refresh entry point.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use disc_client::signed_url;
use disc_client::{ClientError, Direction, Node, Rest, DISCORD_API_URL};
use file_stream::{ChunkReader, ChunkWriter, ParallelChunkWriter, StreamError};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Chunk ceiling for standard tokens.
pub const MAX_CHUNK_SIZE: usize = 25 * 1024 * 1024;
/// Chunk ceiling for nitro basic tokens.
pub const MAX_CHUNK_SIZE_NITRO_BASIC: usize = 50 * 1024 * 1024;
/// Chunk ceiling for nitro tokens.
pub const MAX_CHUNK_SIZE_NITRO: usize = 500 * 1024 * 1024;

/// Request bodies above this are rejected upstream of the service, so
/// larger chunks must take the three-step upload protocol.
const DIRECT_UPLOAD_CEILING: usize = 100 * 1024 * 1024;

/// The credential tier a token belongs to. Decides the chunk-size ceiling
/// and the `Authorization` prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Bot,
    User,
    UserNitro,
    UserNitroBasic,
}

impl TokenType {
    fn chunk_ceiling(self) -> usize {
        match self {
            TokenType::Bot | TokenType::User => MAX_CHUNK_SIZE,
            TokenType::UserNitroBasic => MAX_CHUNK_SIZE_NITRO_BASIC,
            TokenType::UserNitro => MAX_CHUNK_SIZE_NITRO,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub tokens: Vec<String>,
    pub token_type: TokenType,
    pub channels: Vec<String>,
    /// Desired chunk size in bytes; `0` or anything above the tier
    /// ceiling clamps to the ceiling.
    #[serde(default)]
    pub chunk_size: usize,
    /// Forces the three-step upload protocol. Turned on automatically
    /// when the clamped chunk size exceeds the direct-upload ceiling.
    #[serde(default)]
    pub nitro: bool,
}

/// Handle assembled from a validated [`Config`]; front-ends create
/// writers and readers through it.
#[derive(Debug)]
pub struct Driver {
    rest: Arc<Rest>,
    chunk_size: usize,
}

impl Driver {
    pub fn new(config: Config) -> Result<Self, ClientError> {
        Self::with_endpoint(DISCORD_API_URL, config)
    }

    /// Same as [`Driver::new`] against a non-default API endpoint.
    pub fn with_endpoint(endpoint: &str, config: Config) -> Result<Self, ClientError> {
        let ceiling = config.token_type.chunk_ceiling();
        let chunk_size = if config.chunk_size == 0 || config.chunk_size > ceiling {
            ceiling
        } else {
            config.chunk_size
        };
        let nitro = config.nitro || chunk_size > DIRECT_UPLOAD_CEILING;

        let tokens = match config.token_type {
            TokenType::Bot => config.tokens.iter().map(|t| format!("Bot {t}")).collect(),
            _ => config.tokens,
        };

        let rest = Rest::new(endpoint, tokens, config.channels, chunk_size, nitro)?;
        Ok(Self {
            rest: Arc::new(rest),
            chunk_size,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// The underlying REST handle, exposed for migration tooling.
    pub fn rest(&self) -> &Arc<Rest> {
        &self.rest
    }

    /// A writer that uploads one chunk at a time, committing chunks to
    /// `on_chunk` in byte order.
    pub fn new_writer(&self, on_chunk: impl FnMut(Node) + Send + 'static) -> ChunkWriter {
        ChunkWriter::new(self.rest.clone(), self.chunk_size, Box::new(on_chunk))
    }

    /// A writer that uploads chunks in parallel, one worker per channel,
    /// at the cost of `chunk_size × channels` of buffer memory.
    pub fn new_parallel_writer(
        &self,
        on_chunk: impl FnMut(Node) + Send + 'static,
    ) -> ParallelChunkWriter {
        ParallelChunkWriter::new(self.rest.clone(), self.chunk_size, Box::new(on_chunk))
    }

    /// A reader over `nodes` starting at byte `pos`.
    pub fn new_reader(&self, nodes: Vec<Node>, pos: u64) -> Result<ChunkReader, StreamError> {
        ChunkReader::new(self.rest.clone(), nodes, pos)
    }

    /// Re-signs every expired node in place by re-fetching the messages
    /// that own them, grouped per channel. Callers persist the refreshed
    /// nodes afterwards.
    pub async fn refresh_nodes(&self, nodes: &mut [Node]) -> Result<(), ClientError> {
        let now = unix_now();

        let mut expired_by_channel: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, node) in nodes.iter().enumerate() {
            if now > node.expiry as u64 {
                let channel_id = signed_url::extract_channel_id(&node.url)?;
                expired_by_channel.entry(channel_id).or_default().push(idx);
            }
        }
        if expired_by_channel.is_empty() {
            return Ok(());
        }

        for (channel_id, indices) in expired_by_channel {
            debug!(channel_id = %channel_id, expired = indices.len(), "refreshing expired nodes");
            let oldest = indices
                .iter()
                .map(|&idx| nodes[idx].message_id)
                .min()
                .unwrap_or_default();
            let messages = self
                .rest
                .messages(&channel_id, Some((Direction::After, oldest - 1)))
                .await?;

            let mut by_id = HashMap::new();
            for message in &messages {
                by_id.insert(message.parsed_id()?, message);
            }
            for idx in indices {
                let node = &mut nodes[idx];
                if let Some(message) = by_id.get(&node.message_id) {
                    let parts = signed_url::decode(&message.attachment()?.url)?;
                    node.url = parts.canonical_url;
                    node.expiry = parts.expiry;
                    node.issued = parts.issued;
                    node.signature = parts.signature;
                }
            }
        }
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
