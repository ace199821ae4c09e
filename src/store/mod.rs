//! Storage seam for the sync engine.
//!
//! The protocol never touches persistence directly; it goes through
//! [`SyncStore`] to enumerate and fetch entities and through
//! [`ContentSink`] / [`ContentStream`] to move file content as byte streams.

pub mod directory;
pub mod memory;

pub use directory::DirectoryStore;
pub use memory::MemoryStore;

use crate::error::{Result, SyncError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use tokio::io::AsyncRead;

pub type Properties = serde_json::Map<String, serde_json::Value>;

/// A graph node as it travels between instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub properties: Properties,
}

impl NodeRecord {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            name: name.into(),
            properties: Properties::new(),
        }
    }
}

/// A directed relationship between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub rel_type: String,
    pub source_id: String,
    pub target_id: String,
    #[serde(default)]
    pub properties: Properties,
}

impl RelationshipRecord {
    pub fn new(
        id: impl Into<String>,
        rel_type: impl Into<String>,
        source_id: impl Into<String>,
        target_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            rel_type: rel_type.into(),
            source_id: source_id.into(),
            target_id: target_id.into(),
            properties: Properties::new(),
        }
    }
}

/// Summary of a root-level transferable entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncableInfo {
    pub id: String,
    pub name: String,
    pub node_type: String,
    /// Content length for file nodes, 0 otherwise
    pub size: u64,
    pub is_file: bool,
}

/// Readable file content and its declared length.
pub struct ContentStream {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub length: u64,
}

impl std::fmt::Debug for ContentStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentStream")
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

/// Destination for incoming file content.
///
/// Dropping a sink without calling [`commit`](ContentSink::commit) discards
/// everything written to it.
#[async_trait]
pub trait ContentSink: Send {
    async fn write_chunk(&mut self, data: &[u8]) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Entity and content access required by the sync engine.
#[async_trait]
pub trait SyncStore: Send + Sync {
    /// Root-level entities (no incoming relationships), optionally by type.
    async fn list_syncables(&self, type_filter: Option<&str>) -> Result<Vec<SyncableInfo>>;

    async fn fetch_node(&self, id: &str) -> Result<Option<NodeRecord>>;

    /// Outgoing relationships of a node.
    async fn relationships_from(&self, id: &str) -> Result<Vec<RelationshipRecord>>;

    /// Content length of a file node without opening it, `None` for plain
    /// nodes.
    async fn content_size(&self, id: &str) -> Result<Option<u64>>;

    /// Content of a file node, `None` for plain nodes.
    async fn open_content(&self, id: &str) -> Result<Option<ContentStream>>;

    async fn store_node(&self, node: NodeRecord) -> Result<()>;

    async fn store_relationship(&self, relationship: RelationshipRecord) -> Result<()>;

    async fn create_content(&self, node_id: &str, size: u64) -> Result<Box<dyn ContentSink>>;

    /// Persist pending changes. Called once a consumer session completes.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Graph index shared by the bundled stores
// =============================================================================

/// Nodes and relationships keyed by id.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(from = "Manifest", into = "Manifest")]
pub struct Graph {
    nodes: BTreeMap<String, NodeRecord>,
    relationships: BTreeMap<String, RelationshipRecord>,
}

/// On-disk shape of a [`Graph`].
#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    #[serde(default)]
    nodes: Vec<NodeRecord>,
    #[serde(default)]
    relationships: Vec<RelationshipRecord>,
}

impl From<Manifest> for Graph {
    fn from(manifest: Manifest) -> Self {
        let mut graph = Graph::default();
        for node in manifest.nodes {
            graph.insert_node(node);
        }
        for rel in manifest.relationships {
            graph.insert_relationship(rel);
        }
        graph
    }
}

impl From<Graph> for Manifest {
    fn from(graph: Graph) -> Self {
        Manifest {
            nodes: graph.nodes.into_values().collect(),
            relationships: graph.relationships.into_values().collect(),
        }
    }
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_node(&mut self, node: NodeRecord) {
        self.nodes.insert(node.id.clone(), node);
    }

    pub fn insert_relationship(&mut self, rel: RelationshipRecord) {
        self.relationships.insert(rel.id.clone(), rel);
    }

    pub fn node(&self, id: &str) -> Option<&NodeRecord> {
        self.nodes.get(id)
    }

    pub fn relationship(&self, id: &str) -> Option<&RelationshipRecord> {
        self.relationships.get(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn relationship_count(&self) -> usize {
        self.relationships.len()
    }

    pub fn outgoing(&self, id: &str) -> Vec<RelationshipRecord> {
        self.relationships
            .values()
            .filter(|r| r.source_id == id)
            .cloned()
            .collect()
    }

    /// Nodes without incoming relationships, in id order.
    pub fn roots<'a>(&'a self, type_filter: Option<&'a str>) -> impl Iterator<Item = &'a NodeRecord> {
        let targets: HashSet<&str> = self
            .relationships
            .values()
            .map(|r| r.target_id.as_str())
            .collect();

        self.nodes.values().filter(move |n| {
            !targets.contains(n.id.as_str()) && type_filter.map_or(true, |t| n.node_type == t)
        })
    }
}

// =============================================================================
// Subgraph collection
// =============================================================================

/// The entities one transmission moves.
#[derive(Debug, Default, Clone)]
pub struct Subgraph {
    pub nodes: Vec<NodeRecord>,
    pub relationships: Vec<RelationshipRecord>,
}

impl Subgraph {
    pub fn object_count(&self) -> u64 {
        (self.nodes.len() + self.relationships.len()) as u64
    }
}

/// Collect a node and, when `recursive`, everything reachable from it
/// through outgoing relationships. Nodes come out in breadth-first order.
pub async fn collect_subgraph(
    store: &dyn SyncStore,
    root_id: &str,
    recursive: bool,
) -> Result<Subgraph> {
    let root = store
        .fetch_node(root_id)
        .await?
        .ok_or_else(|| SyncError::NotFound(root_id.to_string()))?;

    let mut subgraph = Subgraph::default();
    let mut visited: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<NodeRecord> = VecDeque::new();

    visited.insert(root.id.clone());
    queue.push_back(root);

    while let Some(node) = queue.pop_front() {
        if recursive {
            for rel in store.relationships_from(&node.id).await? {
                if !visited.contains(&rel.target_id) {
                    match store.fetch_node(&rel.target_id).await? {
                        Some(target) => {
                            visited.insert(target.id.clone());
                            queue.push_back(target);
                        }
                        None => {
                            tracing::warn!(
                                "Skipping relationship {}: target {} does not exist",
                                rel.id,
                                rel.target_id
                            );
                            continue;
                        }
                    }
                }
                subgraph.relationships.push(rel);
            }
        }
        subgraph.nodes.push(node);
    }

    Ok(subgraph)
}
