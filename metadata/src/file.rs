use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// A file or directory entry in the metadata tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub id: String,
    pub name: String,
    pub dir: bool,
    /// Total size in bytes, the sum of the file's node sizes. Always 0
    /// for directories.
    #[serde(default)]
    pub size: u64,
    /// Parent entry id; `None` only for the root directory.
    pub parent: Option<String>,
    pub mtime: SystemTime,
}

impl FileEntry {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}
