use std::time::SystemTime;

use async_trait::async_trait;
use disc_client::Node;

use crate::error::Result;
use crate::file::FileEntry;

/// Storage contract for the directory tree, file entries and per-file
/// node lists. The chunk engine consumes this trait; a relational and an
/// embedded key-value implementation sit behind it in deployments, and
/// [`crate::MemoryProvider`] serves tests.
///
/// Paths are POSIX-style with `/` as the root. Id-based operations take
/// the stable entry id handed out by `create`/`stat`.
#[async_trait]
pub trait DataProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn stat(&self, path: &str) -> Result<FileEntry>;

    /// Lists a directory page. `limit == 0` means no limit.
    async fn ls(&self, path: &str, limit: usize, offset: usize) -> Result<Vec<FileEntry>>;

    /// Lists the children of an entry by id.
    async fn get_child(&self, id: &str) -> Result<Vec<FileEntry>>;

    async fn create(&self, name: &str, parent: &str, is_dir: bool) -> Result<FileEntry>;

    /// Renames and/or reparents an entry.
    async fn update(&self, id: &str, parent: &str, entry: FileEntry) -> Result<FileEntry>;

    async fn delete(&self, id: &str, parent: &str) -> Result<()>;

    async fn touch(&self, path: &str) -> Result<()>;

    async fn mkdir(&self, path: &str) -> Result<()>;

    async fn rm(&self, path: &str) -> Result<()>;

    async fn mv(&self, old: &str, new: &str) -> Result<()>;

    async fn chtime(&self, path: &str, mtime: SystemTime) -> Result<()>;

    /// Drops a file's node list ahead of a rewrite.
    async fn truncate(&self, file_id: &str) -> Result<()>;

    /// The file's nodes in stored order. Implementations refresh expired
    /// signed URLs in place (via the driver) and persist the result
    /// before returning, serialized per file id.
    async fn get_nodes(&self, file_id: &str) -> Result<Vec<Node>>;

    /// Appends committed nodes to a file, in the order the writer
    /// delivered them.
    async fn create_nodes(&self, file_id: &str, nodes: Vec<Node>) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
