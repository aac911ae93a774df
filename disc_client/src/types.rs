use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};
use crate::signed_url;

/// A single stored chunk: one remote message carrying one attachment.
///
/// `url` holds the canonical form (no query string); the signed query
/// parameters live in `expiry`, `issued` and `signature` and are
/// recombined by [`signed_url::encode`] when the payload is fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Id of the message that carries this chunk.
    pub message_id: i64,
    /// Canonical download URL, query string stripped.
    pub url: String,
    /// Exact payload size of this chunk in bytes.
    pub size: u32,
    /// Signed-URL expiry, unix seconds.
    pub expiry: u32,
    /// Signed-URL issue time, unix seconds.
    pub issued: u32,
    /// Signed-URL signature, hex.
    pub signature: String,
    /// First byte this chunk covers within its file. Derived on load,
    /// never persisted.
    #[serde(skip)]
    pub start: u64,
    /// Last byte this chunk covers within its file (inclusive). Derived
    /// on load, never persisted.
    #[serde(skip)]
    pub end: u64,
}

impl Node {
    /// Builds a node from an upload or listing response: decodes the
    /// signed attachment URL and records the parent message id.
    pub fn from_attachment(attachment: &Attachment, message_id: i64) -> Result<Self> {
        let parts = signed_url::decode(&attachment.url)?;
        Ok(Node {
            message_id,
            url: parts.canonical_url,
            size: attachment.size,
            expiry: parts.expiry,
            issued: parts.issued,
            signature: parts.signature,
            start: 0,
            end: 0,
        })
    }
}

/// A message returned by the listing endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl Message {
    pub fn parsed_id(&self) -> Result<i64> {
        self.id
            .parse()
            .map_err(|_| ClientError::Decode(format!("message id is not numeric: {}", self.id)))
    }

    /// The single attachment every upload produces. An empty list means
    /// the service returned something we cannot use as a node.
    pub fn attachment(&self) -> Result<&Attachment> {
        self.attachments
            .first()
            .ok_or_else(|| ClientError::Decode(format!("message {} has no attachments", self.id)))
    }
}

/// Attachment fields we consume from the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub size: u32,
}
