//! Directory-backed store.
//!
//! Layout under the root:
//!
//! ```text
//! root/
//!   graph.json       nodes and relationships
//!   files/<node-id>  content of file nodes
//! ```
//!
//! Incoming content is written to a temp file in `files/` and renamed into
//! place on commit. A sink that is dropped before commit (aborted transfer,
//! failed integrity check) removes its temp file.

use super::{
    ContentSink, ContentStream, Graph, NodeRecord, RelationshipRecord, SyncStore, SyncableInfo,
};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tempfile::TempPath;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

const MANIFEST_FILE: &str = "graph.json";
const FILES_DIR: &str = "files";

pub struct DirectoryStore {
    root: PathBuf,
    graph: Mutex<Graph>,
}

/// Reject ids that would escape the files directory.
fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(SyncError::storage("Empty node id not allowed"));
    }

    let path = Path::new(id);
    let mut components = path.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(SyncError::storage(format!(
            "Node id cannot be used as a file name: {}",
            id
        ))),
    }
}

impl DirectoryStore {
    /// Open (or create) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(FILES_DIR)).await?;

        let manifest = root.join(MANIFEST_FILE);
        let graph = match fs::read(&manifest).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Graph::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::debug!("Opened store at {}", root.display());

        Ok(Self {
            root,
            graph: Mutex::new(graph),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn graph(&self) -> MutexGuard<'_, Graph> {
        self.graph.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn content_path(&self, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(self.root.join(FILES_DIR).join(id))
    }

    pub fn node_count(&self) -> usize {
        self.graph().node_count()
    }

    pub fn relationship_count(&self) -> usize {
        self.graph().relationship_count()
    }

    /// Insert a node whose content is copied from `source`.
    pub async fn import_file(&self, node: NodeRecord, source: &Path) -> Result<()> {
        let dest = self.content_path(&node.id)?;
        fs::copy(source, &dest).await?;
        self.graph().insert_node(node);
        Ok(())
    }
}

#[async_trait]
impl SyncStore for DirectoryStore {
    async fn list_syncables(&self, type_filter: Option<&str>) -> Result<Vec<SyncableInfo>> {
        let roots: Vec<NodeRecord> = self.graph().roots(type_filter).cloned().collect();

        let mut list = Vec::with_capacity(roots.len());
        for node in roots {
            let len = self.content_size(&node.id).await?;
            list.push(SyncableInfo {
                id: node.id,
                name: node.name,
                node_type: node.node_type,
                size: len.unwrap_or(0),
                is_file: len.is_some(),
            });
        }
        Ok(list)
    }

    async fn fetch_node(&self, id: &str) -> Result<Option<NodeRecord>> {
        Ok(self.graph().node(id).cloned())
    }

    async fn relationships_from(&self, id: &str) -> Result<Vec<RelationshipRecord>> {
        Ok(self.graph().outgoing(id))
    }

    async fn content_size(&self, id: &str) -> Result<Option<u64>> {
        // Ids that cannot name a file never have content.
        let Ok(path) = self.content_path(id) else {
            return Ok(None);
        };
        match fs::metadata(&path).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn open_content(&self, id: &str) -> Result<Option<ContentStream>> {
        let path = self.content_path(id)?;
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let length = file.metadata().await?.len();

        Ok(Some(ContentStream {
            reader: Box::new(file),
            length,
        }))
    }

    async fn store_node(&self, node: NodeRecord) -> Result<()> {
        self.graph().insert_node(node);
        Ok(())
    }

    async fn store_relationship(&self, relationship: RelationshipRecord) -> Result<()> {
        self.graph().insert_relationship(relationship);
        Ok(())
    }

    async fn create_content(&self, node_id: &str, _size: u64) -> Result<Box<dyn ContentSink>> {
        let dest = self.content_path(node_id)?;
        let dir = self.root.join(FILES_DIR);

        let temp = tokio::task::spawn_blocking(move || tempfile::NamedTempFile::new_in(dir))
            .await
            .map_err(|e| SyncError::storage(format!("Temp file task failed: {}", e)))??;
        let (file, path) = temp.into_parts();

        Ok(Box::new(DirectorySink {
            file: Some(File::from_std(file)),
            temp: Some(path),
            dest,
        }))
    }

    async fn flush(&self) -> Result<()> {
        let json = serde_json::to_vec_pretty(&*self.graph())?;

        let manifest = self.root.join(MANIFEST_FILE);
        let tmp = manifest.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &manifest).await?;

        tracing::debug!("Flushed manifest to {}", manifest.display());
        Ok(())
    }
}

struct DirectorySink {
    file: Option<File>,
    /// Deletes the temp file on drop unless persisted
    temp: Option<TempPath>,
    dest: PathBuf,
}

#[async_trait]
impl ContentSink for DirectorySink {
    async fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        match self.file.as_mut() {
            Some(file) => Ok(file.write_all(data).await?),
            None => Err(SyncError::storage("Content sink already closed")),
        }
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut this = *self;
        if let Some(mut file) = this.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }

        let temp = this
            .temp
            .take()
            .ok_or_else(|| SyncError::storage("Content sink already committed"))?;
        let dest = this.dest;

        tokio::task::spawn_blocking(move || temp.persist(&dest))
            .await
            .map_err(|e| SyncError::storage(format!("Persist task failed: {}", e)))?
            .map_err(|e| SyncError::Io(e.error))?;

        Ok(())
    }
}
