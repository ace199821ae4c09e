//! Per-connection transfer context.
//!
//! Maps container ids to the typed handle of the sub-transfer they scope.
//! Owned by exactly one [`Connection`](crate::connection::Connection) and only
//! touched from its dispatch path, so no locking is needed. Dropping an entry
//! (or the whole store) releases the reader or writer it holds.

use crate::chunk::{ChunkCursor, ChunkSink};
use crate::error::{Result, SyncError};
use std::collections::{HashMap, HashSet};

pub enum ContainerEntry {
    /// Content we produce, advanced by the peer's pulls
    Outgoing(ChunkCursor),
    /// Content we consume
    Incoming(ChunkSink),
}

impl ContainerEntry {
    fn kind(&self) -> &'static str {
        match self {
            ContainerEntry::Outgoing(_) => "outgoing",
            ContainerEntry::Incoming(_) => "incoming",
        }
    }
}

#[derive(Default)]
pub struct ContainerStore {
    entries: HashMap<String, ContainerEntry>,
    /// Outgoing containers whose terminal marker was already sent. Holds one
    /// id per produced file for the lifetime of the connection and is
    /// cleared with the entries once the session completes or aborts.
    exhausted: HashSet<String>,
}

impl ContainerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, container_id: &str) -> Option<&ContainerEntry> {
        self.entries.get(container_id)
    }

    /// Register a container. An id that is still open is never overwritten.
    pub fn insert(&mut self, container_id: impl Into<String>, entry: ContainerEntry) -> Result<()> {
        let container_id = container_id.into();
        if let Some(existing) = self.entries.get(&container_id) {
            return Err(SyncError::protocol(format!(
                "Container {} is already open ({})",
                container_id,
                existing.kind()
            )));
        }

        self.exhausted.remove(&container_id);
        self.entries.insert(container_id, entry);
        Ok(())
    }

    pub fn remove(&mut self, container_id: &str) -> Option<ContainerEntry> {
        let entry = self.entries.remove(container_id)?;
        if matches!(entry, ContainerEntry::Outgoing(_)) {
            self.exhausted.insert(container_id.to_string());
        }
        Some(entry)
    }

    pub fn outgoing_mut(&mut self, container_id: &str) -> Option<&mut ChunkCursor> {
        match self.entries.get_mut(container_id) {
            Some(ContainerEntry::Outgoing(cursor)) => Some(cursor),
            _ => None,
        }
    }

    pub fn incoming_mut(&mut self, container_id: &str) -> Option<&mut ChunkSink> {
        match self.entries.get_mut(container_id) {
            Some(ContainerEntry::Incoming(sink)) => Some(sink),
            _ => None,
        }
    }

    /// Remove and return an incoming container.
    pub fn take_incoming(&mut self, container_id: &str) -> Option<ChunkSink> {
        match self.entries.get(container_id) {
            Some(ContainerEntry::Incoming(_)) => match self.entries.remove(container_id) {
                Some(ContainerEntry::Incoming(sink)) => Some(sink),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn was_exhausted(&self, container_id: &str) -> bool {
        self.exhausted.contains(container_id)
    }

    pub fn incoming_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| matches!(e, ContainerEntry::Incoming(_)))
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every open container, releasing its stream.
    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            tracing::debug!("Releasing {} open containers", self.entries.len());
        }
        self.entries.clear();
        self.exhausted.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, NodeRecord, SyncStore};

    fn cursor(id: &str) -> ContainerEntry {
        ContainerEntry::Outgoing(ChunkCursor::new(id, "node", 3, 2))
    }

    #[test]
    fn test_insert_rejects_open_container() {
        let mut store = ContainerStore::new();
        store.insert("c1", cursor("c1")).unwrap();
        let err = store.insert("c1", cursor("c1")).unwrap_err();
        assert!(matches!(err, SyncError::ProtocolViolation(_)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_remove_marks_outgoing_exhausted() {
        let mut store = ContainerStore::new();
        store.insert("c1", cursor("c1")).unwrap();
        assert!(!store.was_exhausted("c1"));

        assert!(store.remove("c1").is_some());
        assert!(store.was_exhausted("c1"));
        assert!(store.get("c1").is_none());
        assert!(store.remove("c1").is_none());

        // Reuse after close is allowed
        store.insert("c1", cursor("c1")).unwrap();
        assert!(!store.was_exhausted("c1"));
    }

    #[tokio::test]
    async fn test_typed_accessors() {
        let memory = MemoryStore::new();
        let mut store = ContainerStore::new();
        store.insert("out", cursor("out")).unwrap();
        store
            .insert(
                "in",
                ContainerEntry::Incoming(ChunkSink::new(
                    "in",
                    NodeRecord::new("node", "File", "node.bin"),
                    3,
                )),
            )
            .unwrap();
        store
            .incoming_mut("in")
            .unwrap()
            .open(memory.create_content("node", 3).await.unwrap());

        assert!(store.outgoing_mut("out").is_some());
        assert!(store.outgoing_mut("in").is_none());
        assert!(store.incoming_mut("in").is_some());
        assert!(store.incoming_mut("out").is_none());
        assert_eq!(store.incoming_count(), 1);

        assert!(store.take_incoming("out").is_none());
        assert_eq!(store.take_incoming("in").unwrap().node_id(), "node");
        assert_eq!(store.incoming_count(), 0);
        assert!(!store.was_exhausted("in"));

        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn test_clear_forgets_exhausted_ids() {
        let mut store = ContainerStore::new();
        for i in 0..100 {
            let id = format!("c{}", i);
            store.insert(id.clone(), cursor(&id)).unwrap();
            store.remove(&id);
        }
        assert!(store.was_exhausted("c42"));

        store.clear();
        assert!(!store.was_exhausted("c42"));
    }
}
