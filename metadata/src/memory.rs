//! In-memory provider: the embedded implementation used by tests and
//! single-process setups. Holds the chunk driver so `get_nodes` can
//! re-sign expired nodes before handing them out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;
use disc_client::Node;
use drive::Driver;
use tracing::debug;
use utils::PathLocker;
use uuid::Uuid;

use crate::error::{MetaError, Result};
use crate::file::FileEntry;
use crate::name::validate_name;
use crate::provider::DataProvider;

struct Entry {
    meta: FileEntry,
    nodes: Vec<Node>,
}

struct State {
    entries: HashMap<String, Entry>,
    root_id: String,
}

pub struct MemoryProvider {
    state: Mutex<State>,
    driver: Arc<Driver>,
    /// Serializes node refresh + writeback per file id.
    locker: PathLocker,
}

impl MemoryProvider {
    pub fn new(driver: Arc<Driver>) -> Self {
        let root_id = Uuid::new_v4().to_string();
        let root = Entry {
            meta: FileEntry {
                id: root_id.clone(),
                name: "/".to_string(),
                dir: true,
                size: 0,
                parent: None,
                mtime: SystemTime::now(),
            },
            nodes: Vec::new(),
        };
        let mut entries = HashMap::new();
        entries.insert(root_id.clone(), root);
        Self {
            state: Mutex::new(State { entries, root_id }),
            driver,
            locker: PathLocker::new(),
        }
    }
}

fn components(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty()).collect()
}

impl State {
    fn resolve(&self, path: &str) -> Result<String> {
        let mut id = self.root_id.clone();
        for component in components(path) {
            id = self
                .child_by_name(&id, component)
                .ok_or(MetaError::NotExist)?;
        }
        Ok(id)
    }

    fn child_by_name(&self, parent_id: &str, name: &str) -> Option<String> {
        self.entries
            .values()
            .find(|e| e.meta.parent.as_deref() == Some(parent_id) && e.meta.name == name)
            .map(|e| e.meta.id.clone())
    }

    fn children(&self, parent_id: &str) -> Vec<FileEntry> {
        let mut children: Vec<FileEntry> = self
            .entries
            .values()
            .filter(|e| e.meta.parent.as_deref() == Some(parent_id))
            .map(|e| e.meta.clone())
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        children
    }

    fn entry(&self, id: &str) -> Result<&Entry> {
        self.entries.get(id).ok_or(MetaError::NotExist)
    }

    fn require_dir(&self, id: &str) -> Result<()> {
        if !self.entry(id)?.meta.dir {
            return Err(MetaError::InvalidParent);
        }
        Ok(())
    }

    fn insert(&mut self, name: &str, parent_id: &str, is_dir: bool) -> Result<FileEntry> {
        validate_name(name)?;
        self.require_dir(parent_id)?;
        if self.child_by_name(parent_id, name).is_some() {
            return Err(MetaError::Exist);
        }
        let meta = FileEntry {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            dir: is_dir,
            size: 0,
            parent: Some(parent_id.to_string()),
            mtime: SystemTime::now(),
        };
        self.entries.insert(
            meta.id.clone(),
            Entry {
                meta: meta.clone(),
                nodes: Vec::new(),
            },
        );
        Ok(meta)
    }

    fn remove_tree(&mut self, id: &str) {
        let children: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.meta.parent.as_deref() == Some(id))
            .map(|e| e.meta.id.clone())
            .collect();
        for child in children {
            self.remove_tree(&child);
        }
        self.entries.remove(id);
    }
}

#[async_trait]
impl DataProvider for MemoryProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn stat(&self, path: &str) -> Result<FileEntry> {
        let state = self.state.lock().unwrap();
        let id = state.resolve(path)?;
        Ok(state.entry(&id)?.meta.clone())
    }

    async fn ls(&self, path: &str, limit: usize, offset: usize) -> Result<Vec<FileEntry>> {
        let state = self.state.lock().unwrap();
        let id = state.resolve(path)?;
        state.require_dir(&id)?;
        let children = state.children(&id);
        let page = children.into_iter().skip(offset);
        Ok(if limit == 0 {
            page.collect()
        } else {
            page.take(limit).collect()
        })
    }

    async fn get_child(&self, id: &str) -> Result<Vec<FileEntry>> {
        let state = self.state.lock().unwrap();
        state.entry(id)?;
        Ok(state.children(id))
    }

    async fn create(&self, name: &str, parent: &str, is_dir: bool) -> Result<FileEntry> {
        debug!(name, parent, is_dir, "create entry");
        self.state.lock().unwrap().insert(name, parent, is_dir)
    }

    async fn update(&self, id: &str, parent: &str, entry: FileEntry) -> Result<FileEntry> {
        validate_name(&entry.name)?;
        let mut state = self.state.lock().unwrap();
        state.entry(id)?;
        state.require_dir(parent)?;
        if let Some(conflict) = state.child_by_name(parent, &entry.name) {
            if conflict != id {
                return Err(MetaError::Exist);
            }
        }
        let existing = state.entries.get_mut(id).ok_or(MetaError::NotExist)?;
        existing.meta.name = entry.name;
        existing.meta.parent = Some(parent.to_string());
        existing.meta.mtime = SystemTime::now();
        Ok(existing.meta.clone())
    }

    async fn delete(&self, id: &str, _parent: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if id == state.root_id {
            return Err(MetaError::Permission);
        }
        state.entry(id)?;
        state.remove_tree(id);
        Ok(())
    }

    async fn touch(&self, path: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Ok(id) = state.resolve(path) {
            let entry = state.entries.get_mut(&id).ok_or(MetaError::NotExist)?;
            entry.meta.mtime = SystemTime::now();
            return Ok(());
        }
        let (dir, name) = split_parent(path)?;
        let parent_id = state.resolve(&dir)?;
        state.insert(&name, &parent_id, false)?;
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let (dir, name) = split_parent(path)?;
        let parent_id = state.resolve(&dir)?;
        state.insert(&name, &parent_id, true)?;
        Ok(())
    }

    async fn rm(&self, path: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let id = state.resolve(path)?;
        if id == state.root_id {
            return Err(MetaError::Permission);
        }
        state.remove_tree(&id);
        Ok(())
    }

    async fn mv(&self, old: &str, new: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let id = state.resolve(old)?;
        if id == state.root_id {
            return Err(MetaError::Permission);
        }
        let (dir, name) = split_parent(new)?;
        validate_name(&name)?;
        let parent_id = state.resolve(&dir)?;
        state.require_dir(&parent_id)?;
        if let Some(conflict) = state.child_by_name(&parent_id, &name) {
            if conflict != id {
                return Err(MetaError::Exist);
            }
        }
        let entry = state.entries.get_mut(&id).ok_or(MetaError::NotExist)?;
        entry.meta.name = name;
        entry.meta.parent = Some(parent_id);
        entry.meta.mtime = SystemTime::now();
        Ok(())
    }

    async fn chtime(&self, path: &str, mtime: SystemTime) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let id = state.resolve(path)?;
        let entry = state.entries.get_mut(&id).ok_or(MetaError::NotExist)?;
        entry.meta.mtime = mtime;
        Ok(())
    }

    async fn truncate(&self, file_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let entry = state.entries.get_mut(file_id).ok_or(MetaError::NotExist)?;
        if entry.meta.dir {
            return Err(MetaError::Permission);
        }
        entry.nodes.clear();
        entry.meta.size = 0;
        Ok(())
    }

    async fn get_nodes(&self, file_id: &str) -> Result<Vec<Node>> {
        let _guard = self.locker.acquire(file_id).await;

        let mut nodes = {
            let state = self.state.lock().unwrap();
            state.entry(file_id)?.nodes.clone()
        };

        // Re-sign expired URLs and persist the result before handing the
        // list out; the per-id guard keeps concurrent readers from racing
        // the writeback.
        self.driver
            .refresh_nodes(&mut nodes)
            .await
            .map_err(|e| MetaError::Backend(e.to_string()))?;

        let mut state = self.state.lock().unwrap();
        let entry = state.entries.get_mut(file_id).ok_or(MetaError::NotExist)?;
        entry.nodes = nodes.clone();
        Ok(nodes)
    }

    async fn create_nodes(&self, file_id: &str, nodes: Vec<Node>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let entry = state.entries.get_mut(file_id).ok_or(MetaError::NotExist)?;
        if entry.meta.dir {
            return Err(MetaError::Permission);
        }
        entry.meta.size += nodes.iter().map(|n| n.size as u64).sum::<u64>();
        entry.meta.mtime = SystemTime::now();
        entry.nodes.extend(nodes);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Splits `/a/b/c` into the parent path `/a/b` and the final component.
fn split_parent(path: &str) -> Result<(String, String)> {
    let mut parts = components(path);
    let name = parts
        .pop()
        .ok_or_else(|| MetaError::InvalidName("path has no final component".to_string()))?;
    Ok((format!("/{}", parts.join("/")), name.to_string()))
}
