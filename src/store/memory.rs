//! In-memory store.
//!
//! Clones share the same graph, so a test can hand one clone to a server and
//! inspect the other afterwards.

use super::{
    ContentSink, ContentStream, Graph, NodeRecord, RelationshipRecord, SyncStore, SyncableInfo,
};
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Inner {
    graph: Graph,
    content: HashMap<String, Bytes>,
}

#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_graph(graph: Graph) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                graph,
                content: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert_node(&self, node: NodeRecord) {
        self.lock().graph.insert_node(node);
    }

    pub fn insert_relationship(&self, rel: RelationshipRecord) {
        self.lock().graph.insert_relationship(rel);
    }

    /// Insert a file node together with its content.
    pub fn insert_file(&self, node: NodeRecord, content: impl Into<Bytes>) {
        let mut inner = self.lock();
        inner.content.insert(node.id.clone(), content.into());
        inner.graph.insert_node(node);
    }

    pub fn node(&self, id: &str) -> Option<NodeRecord> {
        self.lock().graph.node(id).cloned()
    }

    pub fn relationship(&self, id: &str) -> Option<RelationshipRecord> {
        self.lock().graph.relationship(id).cloned()
    }

    pub fn content(&self, id: &str) -> Option<Bytes> {
        self.lock().content.get(id).cloned()
    }

    pub fn node_count(&self) -> usize {
        self.lock().graph.node_count()
    }

    pub fn relationship_count(&self) -> usize {
        self.lock().graph.relationship_count()
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn list_syncables(&self, type_filter: Option<&str>) -> Result<Vec<SyncableInfo>> {
        let inner = self.lock();
        Ok(inner
            .graph
            .roots(type_filter)
            .map(|node| {
                let content = inner.content.get(&node.id);
                SyncableInfo {
                    id: node.id.clone(),
                    name: node.name.clone(),
                    node_type: node.node_type.clone(),
                    size: content.map_or(0, |c| c.len() as u64),
                    is_file: content.is_some(),
                }
            })
            .collect())
    }

    async fn fetch_node(&self, id: &str) -> Result<Option<NodeRecord>> {
        Ok(self.node(id))
    }

    async fn relationships_from(&self, id: &str) -> Result<Vec<RelationshipRecord>> {
        Ok(self.lock().graph.outgoing(id))
    }

    async fn content_size(&self, id: &str) -> Result<Option<u64>> {
        Ok(self.lock().content.get(id).map(|c| c.len() as u64))
    }

    async fn open_content(&self, id: &str) -> Result<Option<ContentStream>> {
        Ok(self.content(id).map(|bytes| ContentStream {
            length: bytes.len() as u64,
            reader: Box::new(Cursor::new(bytes)),
        }))
    }

    async fn store_node(&self, node: NodeRecord) -> Result<()> {
        self.insert_node(node);
        Ok(())
    }

    async fn store_relationship(&self, relationship: RelationshipRecord) -> Result<()> {
        self.insert_relationship(relationship);
        Ok(())
    }

    async fn create_content(&self, node_id: &str, size: u64) -> Result<Box<dyn ContentSink>> {
        Ok(Box::new(MemorySink {
            store: self.clone(),
            node_id: node_id.to_string(),
            buf: Vec::with_capacity(size.min(16 * 1024 * 1024) as usize),
        }))
    }
}

struct MemorySink {
    store: MemoryStore,
    node_id: String,
    buf: Vec<u8>,
}

#[async_trait]
impl ContentSink for MemorySink {
    async fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(data);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        this.store
            .lock()
            .content
            .insert(this.node_id, Bytes::from(this.buf));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_open_content_reads_all_bytes() {
        let store = MemoryStore::new();
        store.insert_file(NodeRecord::new("f", "File", "a.txt"), &b"hello world"[..]);

        let mut stream = store.open_content("f").await.unwrap().unwrap();
        assert_eq!(stream.length, 11);
        let mut out = String::new();
        stream.reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");

        assert!(store.open_content("missing").await.unwrap().is_none());
        assert_eq!(store.content_size("f").await.unwrap(), Some(11));
        assert_eq!(store.content_size("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_uncommitted_sink_is_discarded() {
        let store = MemoryStore::new();
        let mut sink = store.create_content("f", 4).await.unwrap();
        sink.write_chunk(b"abcd").await.unwrap();
        drop(sink);
        assert!(store.content("f").is_none());

        let mut sink = store.create_content("f", 4).await.unwrap();
        sink.write_chunk(b"ab").await.unwrap();
        sink.write_chunk(b"cd").await.unwrap();
        sink.commit().await.unwrap();
        assert_eq!(store.content("f").unwrap(), Bytes::from_static(b"abcd"));
    }

    #[tokio::test]
    async fn test_list_syncables_marks_files() {
        let store = MemoryStore::new();
        store.insert_node(NodeRecord::new("p", "Page", "home"));
        store.insert_file(NodeRecord::new("f", "File", "a.bin"), vec![0u8; 42]);

        let list = store.list_syncables(None).await.unwrap();
        assert_eq!(list.len(), 2);
        let file = list.iter().find(|s| s.id == "f").unwrap();
        assert!(file.is_file);
        assert_eq!(file.size, 42);

        let pages = store.list_syncables(Some("Page")).await.unwrap();
        assert_eq!(pages.len(), 1);
        assert!(!pages[0].is_file);
    }
}
