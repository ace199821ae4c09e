//! One physical sync session.
//!
//! A [`Connection`] owns the duplex stream, the per-session
//! [`ContainerStore`] and the dispatch loop. Everything happens on the task
//! that drives it: a frame is read, decoded, dispatched to its handler, and
//! the handler's replies are written before the next frame is read. No two
//! messages on one connection are ever handled concurrently.
//!
//! Both peers run the same handlers. Which side produces and which consumes
//! depends on the flow, not on the role:
//!
//! ```text
//! Pull:  client --PullNode--> server (producer)  --Begin/NodeData/...--> client (consumer)
//! Push:  client (producer) --Begin/NodeData/...--> server (consumer)
//! ```
//!
//! The consumer sends `Finish` once it has seen `End` and every incoming
//! container has been verified; sending or receiving `Finish` completes the
//! session on either side.
//!
//! File content is pulled one container at a time. The consumer queues each
//! announced file and only creates its destination when the previous one has
//! been verified; the producer opens a file on its first pull and closes it
//! after the last chunk. Neither side holds more than one open file per
//! session however large the subgraph is.

use crate::chunk::{ChunkCursor, ChunkSink};
use crate::config::TransferConfig;
use crate::context::{ContainerEntry, ContainerStore};
use crate::error::{Result, SyncError};
use crate::listener::ListenerGuard;
use crate::protocol::{
    self, authentication_request, AuthenticationResponse, Authenticator, Begin, End, FileNodeChunk,
    FileNodeData, FileNodeEndChunk, Finish, ListSyncables, Message, NodeData, PullChunk, PullNode,
    RelationshipData, RemoteError, SyncableList,
};
use crate::store::{collect_subgraph, Subgraph, SyncStore, SyncableInfo};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tracing::{debug, error, warn};

/// Which end of the socket this connection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    /// `Finish` sent or received
    Complete,
    /// Aborted, rejected, or torn down
    Closed,
}

/// Counters for one session.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    /// Objects announced by `Begin`
    pub objects_total: u64,
    pub objects_completed: u64,
    pub chunks_sent: u64,
    pub chunks_received: u64,
    /// File content bytes moved in either direction
    pub bytes_transferred: u64,
    /// Peer requests that were ignored as protocol anomalies
    pub anomalies: u64,
}

pub struct Connection<S> {
    stream: BufStream<S>,
    role: Role,
    store: Arc<dyn SyncStore>,
    config: TransferConfig,
    containers: ContainerStore,
    /// Incoming containers announced but not pulled yet
    queued: VecDeque<String>,
    /// Incoming container currently being pulled
    active_incoming: Option<String>,
    state: SessionState,
    stats: SessionStats,
    listener: Option<ListenerGuard>,
    /// Consumer has seen `End`
    end_received: bool,
    syncables: Vec<SyncableInfo>,
    remote_objects: Option<u64>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, role: Role, store: Arc<dyn SyncStore>, config: TransferConfig) -> Self {
        Self {
            stream: BufStream::new(stream),
            role,
            store,
            config,
            containers: ContainerStore::new(),
            queued: VecDeque::new(),
            active_incoming: None,
            state: SessionState::Active,
            stats: SessionStats::default(),
            listener: None,
            end_received: false,
            syncables: Vec::new(),
            remote_objects: None,
        }
    }

    pub fn set_listener(&mut self, listener: ListenerGuard) {
        self.listener = Some(listener);
    }

    pub fn take_listener(&mut self) -> Option<ListenerGuard> {
        self.listener.take()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == SessionState::Complete
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Listing received in answer to `ListSyncables`.
    pub fn take_syncables(&mut self) -> Vec<SyncableInfo> {
        std::mem::take(&mut self.syncables)
    }

    /// Object count reported by the peer's `Finish`.
    pub fn remote_objects(&self) -> Option<u64> {
        self.remote_objects
    }

    // =========================================================================
    // Context store
    // =========================================================================

    pub fn get_value(&self, container_id: &str) -> Option<&ContainerEntry> {
        self.containers.get(container_id)
    }

    pub fn insert_value(&mut self, container_id: impl Into<String>, entry: ContainerEntry) -> Result<()> {
        if self.state == SessionState::Closed {
            return Err(SyncError::Transport("Connection closed".to_string()));
        }
        self.containers.insert(container_id, entry)
    }

    pub fn remove_value(&mut self, container_id: &str) -> Option<ContainerEntry> {
        self.containers.remove(container_id)
    }

    // =========================================================================
    // Send path
    // =========================================================================

    /// Write one message, then run its post-send hook.
    pub async fn send(&mut self, msg: Message) -> Result<()> {
        if self.state == SessionState::Closed {
            return Err(SyncError::Transport("Connection closed".to_string()));
        }

        let frame = msg.encode()?;
        protocol::write_frame(&mut self.stream, &frame).await?;
        self.stats.messages_sent += 1;
        debug!("{:?} sent {:?}", self.role, msg.message_type());

        self.after_send(&msg);
        Ok(())
    }

    fn after_send(&mut self, msg: &Message) {
        match msg {
            Message::Begin(begin) => self.stats.objects_total = begin.total,
            Message::NodeData(_) | Message::RelationshipData(_) | Message::FileNodeEndChunk(_) => {
                self.record_completed();
            }
            Message::FileNodeChunk(chunk) => {
                self.stats.chunks_sent += 1;
                self.stats.bytes_transferred += chunk.data.len() as u64;
            }
            Message::Finish(_) => self.state = SessionState::Complete,
            Message::AuthenticationResponse(resp) if !resp.accepted => {
                self.state = SessionState::Closed;
            }
            Message::Error(_) => self.state = SessionState::Closed,
            _ => {}
        }
    }

    fn record_completed(&mut self) {
        self.stats.objects_completed += 1;
        let (current, total) = (self.stats.objects_completed, self.stats.objects_total);
        if let Some(listener) = self.listener.as_mut() {
            listener.progress(current, total);
        }
    }

    // =========================================================================
    // Receive path
    // =========================================================================

    pub async fn read_message(&mut self) -> Result<Option<Message>> {
        let msg = protocol::read_message(&mut self.stream).await?;
        if let Some(ref msg) = msg {
            self.stats.messages_received += 1;
            debug!("{:?} received {:?}", self.role, msg.message_type());
        }
        Ok(msg)
    }

    /// Dispatch loop. Returns once the session completes.
    ///
    /// Any handler error is logged, reported to the peer when the socket is
    /// still usable, and closes the connection. Nothing is retried.
    pub async fn run(&mut self) -> Result<()> {
        while self.state == SessionState::Active {
            let result = match self.read_message().await {
                Ok(Some(msg)) => self.dispatch(msg).await,
                Ok(None) => Err(SyncError::Transport(
                    "Peer closed connection before transmission completed".to_string(),
                )),
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                self.abort(&e).await;
                return Err(e);
            }
        }

        if self.state == SessionState::Closed {
            return Err(SyncError::Transport("Connection closed".to_string()));
        }
        Ok(())
    }

    /// Handler table: one arm per message variant.
    pub async fn dispatch(&mut self, msg: Message) -> Result<()> {
        match msg {
            Message::AuthenticationRequest(_) | Message::AuthenticationResponse(_) => Err(
                SyncError::protocol("Authentication message outside of handshake"),
            ),
            Message::ListSyncables(req) => self.on_list_syncables(req).await,
            Message::SyncableList(list) => self.on_syncable_list(list).await,
            Message::PullNode(req) => self.on_pull_node(req).await,
            Message::Begin(begin) => {
                self.stats.objects_total = begin.total;
                Ok(())
            }
            Message::NodeData(data) => self.on_node_data(data).await,
            Message::RelationshipData(data) => self.on_relationship_data(data).await,
            Message::FileNodeData(data) => self.on_file_node_data(data).await,
            Message::PullChunk(pull) => self.on_pull_chunk(pull).await,
            Message::FileNodeChunk(chunk) => self.on_file_node_chunk(chunk).await,
            Message::FileNodeEndChunk(end) => self.on_file_node_end_chunk(end).await,
            Message::End(end) => self.on_end(end).await,
            Message::Finish(finish) => {
                self.remote_objects = Some(finish.objects);
                self.state = SessionState::Complete;
                self.release_containers();
                Ok(())
            }
            Message::Error(err) => {
                self.state = SessionState::Closed;
                Err(SyncError::Remote {
                    code: err.code,
                    message: err.message,
                })
            }
        }
    }

    // =========================================================================
    // Handlers
    // =========================================================================

    async fn on_list_syncables(&mut self, req: ListSyncables) -> Result<()> {
        let entries = self.store.list_syncables(req.type_filter.as_deref()).await?;
        debug!("Listing {} syncable entities", entries.len());
        self.send(Message::SyncableList(SyncableList { entries })).await
    }

    async fn on_syncable_list(&mut self, list: SyncableList) -> Result<()> {
        let count = list.entries.len() as u64;
        self.stats.objects_total = count;
        self.stats.objects_completed = count;
        self.syncables = list.entries;
        self.send(Message::Finish(Finish { objects: count })).await
    }

    async fn on_pull_node(&mut self, req: PullNode) -> Result<()> {
        let subgraph = collect_subgraph(self.store.as_ref(), &req.node_id, req.is_recursive()).await?;
        self.produce(subgraph).await
    }

    /// Stream a subgraph to the peer: `Begin`, one message per node and
    /// relationship, `End`. File nodes get an unopened chunk cursor
    /// registered before their `FileNodeData` goes out, so the peer's first
    /// pull finds it.
    pub async fn produce(&mut self, subgraph: Subgraph) -> Result<()> {
        let total = subgraph.object_count();
        self.send(Message::Begin(Begin { total })).await?;

        for node in subgraph.nodes {
            match self.store.content_size(&node.id).await? {
                Some(file_size) => {
                    let container_id = uuid::Uuid::new_v4().to_string();
                    let cursor = ChunkCursor::new(
                        container_id.clone(),
                        node.id.clone(),
                        file_size,
                        self.config.chunk_size,
                    );
                    self.insert_value(container_id.clone(), ContainerEntry::Outgoing(cursor))?;

                    self.send(Message::FileNodeData(FileNodeData {
                        container_id,
                        file_size,
                        node,
                    }))
                    .await?;
                }
                None => self.send(Message::NodeData(NodeData { node })).await?,
            }
        }

        for relationship in subgraph.relationships {
            self.send(Message::RelationshipData(RelationshipData { relationship }))
                .await?;
        }

        self.send(Message::End(End { count: total })).await
    }

    async fn on_node_data(&mut self, data: NodeData) -> Result<()> {
        self.store.store_node(data.node).await?;
        self.record_completed();
        Ok(())
    }

    async fn on_relationship_data(&mut self, data: RelationshipData) -> Result<()> {
        self.store.store_relationship(data.relationship).await?;
        self.record_completed();
        Ok(())
    }

    async fn on_file_node_data(&mut self, data: FileNodeData) -> Result<()> {
        let FileNodeData {
            container_id,
            file_size,
            node,
        } = data;

        if self.containers.get(&container_id).is_some() {
            return Err(SyncError::protocol(format!(
                "Container {} is already open",
                container_id
            )));
        }

        // The node is only stored once its content has been verified
        let sink = ChunkSink::new(container_id.clone(), node, file_size);
        self.insert_value(container_id.clone(), ContainerEntry::Incoming(sink))?;
        self.queued.push_back(container_id);
        self.pull_next_file().await
    }

    /// Start pulling the next queued file unless one is already in flight.
    async fn pull_next_file(&mut self) -> Result<()> {
        if self.active_incoming.is_some() {
            return Ok(());
        }

        while let Some(container_id) = self.queued.pop_front() {
            let Some(sink) = self.containers.incoming_mut(&container_id) else {
                continue;
            };
            let content = self.store.create_content(sink.node_id(), sink.file_size()).await?;
            sink.open(content);
            let pull = sink.next_pull();

            self.active_incoming = Some(container_id);
            return self.send(Message::PullChunk(pull)).await;
        }
        Ok(())
    }

    async fn on_pull_chunk(&mut self, pull: PullChunk) -> Result<()> {
        let reply = match self.containers.outgoing_mut(&pull.container_id) {
            Some(cursor) => {
                if pull.sequence != cursor.next_sequence() {
                    return Err(SyncError::protocol(format!(
                        "Pull for chunk {} of container {}, next is {}",
                        pull.sequence,
                        pull.container_id,
                        cursor.next_sequence()
                    )));
                }
                if !cursor.is_open() && !cursor.is_exhausted() {
                    let content = self
                        .store
                        .open_content(cursor.node_id())
                        .await?
                        .ok_or_else(|| {
                            SyncError::storage(format!(
                                "Content of {} disappeared",
                                cursor.node_id()
                            ))
                        })?;
                    cursor.open(content)?;
                }
                match cursor.next_chunk().await? {
                    Some(chunk) => Message::FileNodeChunk(chunk),
                    None => Message::FileNodeEndChunk(cursor.end_chunk()),
                }
            }
            None => {
                if self.containers.was_exhausted(&pull.container_id) {
                    debug!(
                        "Ignoring pull for exhausted container {}",
                        pull.container_id
                    );
                } else {
                    self.stats.anomalies += 1;
                    warn!(
                        "Pull for unknown container {} ignored",
                        pull.container_id
                    );
                }
                return Ok(());
            }
        };

        if let Message::FileNodeEndChunk(_) = reply {
            // Removing the cursor first guarantees a single end marker
            self.remove_value(&pull.container_id);
        }

        self.send(reply).await
    }

    async fn on_file_node_chunk(&mut self, chunk: FileNodeChunk) -> Result<()> {
        let sink = self
            .containers
            .incoming_mut(&chunk.container_id)
            .ok_or_else(|| {
                SyncError::protocol(format!(
                    "Chunk {} for unknown container {}",
                    chunk.sequence, chunk.container_id
                ))
            })?;

        sink.append(&chunk).await?;
        let received = sink.received();
        let pull = sink.next_pull();

        self.stats.chunks_received += 1;
        self.stats.bytes_transferred += chunk.data.len() as u64;

        let interval = self.config.progress_interval.max(1);
        if (chunk.sequence + 1) % interval == 0 {
            if let Some(listener) = self.listener.as_mut() {
                listener.chunk_progress(&chunk.container_id, received, chunk.file_size);
            }
        }

        self.send(Message::PullChunk(pull)).await
    }

    async fn on_file_node_end_chunk(&mut self, end: FileNodeEndChunk) -> Result<()> {
        let sink = self.containers.take_incoming(&end.container_id).ok_or_else(|| {
            SyncError::protocol(format!(
                "End marker for unknown container {}",
                end.container_id
            ))
        })?;

        if self.active_incoming.as_deref() == Some(end.container_id.as_str()) {
            self.active_incoming = None;
        }

        let (node, total) = sink.finish(&end).await?;
        debug!("File {} complete ({} bytes)", node.id, total);
        self.store.store_node(node).await?;

        if let Some(listener) = self.listener.as_mut() {
            listener.chunk_progress(&end.container_id, total, end.file_size);
        }
        self.record_completed();
        self.pull_next_file().await?;
        self.finish_if_done().await
    }

    async fn on_end(&mut self, end: End) -> Result<()> {
        self.end_received = true;
        if end.count != self.stats.objects_total {
            warn!(
                "Peer announced {} objects but ended after {}",
                self.stats.objects_total, end.count
            );
            self.stats.objects_total = end.count;
        }
        self.finish_if_done().await
    }

    async fn finish_if_done(&mut self) -> Result<()> {
        if !self.end_received
            || self.containers.incoming_count() > 0
            || self.state != SessionState::Active
        {
            return Ok(());
        }

        self.store.flush().await?;
        self.release_containers();
        let objects = self.stats.objects_completed;
        self.send(Message::Finish(Finish { objects })).await
    }

    // =========================================================================
    // Handshake & teardown
    // =========================================================================

    /// Client side of the handshake.
    pub async fn authenticate(&mut self, username: &str, password: &str) -> Result<()> {
        self.send(Message::AuthenticationRequest(authentication_request(
            username, password,
        )))
        .await?;

        match self.read_message().await? {
            Some(Message::AuthenticationResponse(AuthenticationResponse { accepted: true, .. })) => {
                Ok(())
            }
            Some(Message::AuthenticationResponse(resp)) => {
                self.state = SessionState::Closed;
                Err(SyncError::Authentication(resp.reason))
            }
            Some(Message::Error(err)) => {
                self.state = SessionState::Closed;
                Err(SyncError::Remote {
                    code: err.code,
                    message: err.message,
                })
            }
            Some(other) => Err(SyncError::protocol(format!(
                "Expected AuthenticationResponse, got {:?}",
                other.message_type()
            ))),
            None => Err(SyncError::Transport(
                "Peer closed connection during handshake".to_string(),
            )),
        }
    }

    /// Server side of the handshake: the first frame must authenticate.
    pub async fn accept_authentication(&mut self, authenticator: &Authenticator) -> Result<()> {
        match self.read_message().await? {
            Some(Message::AuthenticationRequest(req)) => {
                let response = authenticator.verify(&req);
                let accepted = response.accepted;
                let reason = response.reason.clone();
                self.send(Message::AuthenticationResponse(response)).await?;

                if accepted {
                    Ok(())
                } else {
                    Err(SyncError::Authentication(format!(
                        "Rejected {}: {}",
                        req.username, reason
                    )))
                }
            }
            Some(other) => Err(SyncError::protocol(format!(
                "Expected AuthenticationRequest, got {:?}",
                other.message_type()
            ))),
            None => Err(SyncError::Transport(
                "Peer closed connection before authenticating".to_string(),
            )),
        }
    }

    /// Tear down after a failure: tell the peer if possible, drop every
    /// open container, mark the connection closed.
    pub async fn abort(&mut self, err: &SyncError) {
        error!("{:?} connection aborted: {}", self.role, err);

        let peer_reachable = !matches!(
            err,
            SyncError::Transport(_) | SyncError::Unreachable { .. } | SyncError::Remote { .. }
        );
        if peer_reachable && self.state != SessionState::Closed {
            let report = Message::Error(RemoteError {
                code: err.code(),
                message: err.to_string(),
            });
            if let Err(e) = self.send(report).await {
                debug!("Could not report error to peer: {}", e);
            }
        }

        self.state = SessionState::Closed;
        self.release_containers();
    }

    fn release_containers(&mut self) {
        self.containers.clear();
        self.queued.clear();
        self.active_incoming = None;
    }

    /// Close the stream. Open containers are released.
    pub async fn close(&mut self) {
        if self.state == SessionState::Active {
            self.state = SessionState::Closed;
        }
        self.release_containers();
        if let Err(e) = self.stream.shutdown().await {
            debug!("Shutdown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{ChannelListener, TransmissionEvent};
    use crate::store::{ContentStream, MemoryStore, NodeRecord, RelationshipRecord};
    use std::io::Cursor;
    use tokio::io::DuplexStream;

    const BUF: usize = 256 * 1024;

    fn connection(role: Role, store: MemoryStore, chunk_size: usize) -> (Connection<DuplexStream>, DuplexStream) {
        let (local, remote) = tokio::io::duplex(BUF);
        let config = TransferConfig {
            chunk_size,
            ..TransferConfig::default()
        };
        (Connection::new(local, role, Arc::new(store), config), remote)
    }

    fn cursor(id: &str, data: Vec<u8>, chunk_size: usize) -> ContainerEntry {
        let mut cursor = ChunkCursor::new(id, "n", data.len() as u64, chunk_size);
        cursor
            .open(ContentStream {
                length: data.len() as u64,
                reader: Box::new(Cursor::new(data)),
            })
            .unwrap();
        ContainerEntry::Outgoing(cursor)
    }

    fn file_data(container_id: &str, node_id: &str, file_size: u64) -> Message {
        Message::FileNodeData(FileNodeData {
            container_id: container_id.to_string(),
            file_size,
            node: NodeRecord::new(node_id, "File", format!("{}.bin", node_id)),
        })
    }

    fn file_chunk(container_id: &str, sequence: u32, file_size: u64, data: &'static [u8]) -> Message {
        Message::FileNodeChunk(FileNodeChunk {
            container_id: container_id.to_string(),
            file_size,
            sequence,
            chunk_size: 1024,
            data: bytes::Bytes::from_static(data),
        })
    }

    fn end_chunk(container_id: &str, file_size: u64) -> Message {
        Message::FileNodeEndChunk(FileNodeEndChunk {
            container_id: container_id.to_string(),
            file_size,
        })
    }

    async fn expect_pull(remote: &mut DuplexStream, container_id: &str, sequence: u32) {
        match protocol::read_message(remote).await.unwrap() {
            Some(Message::PullChunk(pull)) => {
                assert_eq!(pull.container_id, container_id);
                assert_eq!(pull.sequence, sequence);
            }
            other => panic!("Expected PullChunk for {}, got {:?}", container_id, other),
        }
    }

    fn pull(id: &str, sequence: u32) -> Message {
        Message::PullChunk(PullChunk {
            container_id: id.to_string(),
            sequence,
            file_size: 25_000,
        })
    }

    async fn read_all(mut remote: DuplexStream) -> Vec<Message> {
        let mut out = Vec::new();
        while let Some(msg) = protocol::read_message(&mut remote).await.unwrap() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn test_pull_loop_sends_single_end_marker() {
        let store = MemoryStore::new();
        store.insert_file(NodeRecord::new("n", "File", "n.bin"), vec![5u8; 25_000]);
        let (mut conn, remote) = connection(Role::Server, store, 10_000);
        conn.insert_value("c", ContainerEntry::Outgoing(ChunkCursor::new("c", "n", 25_000, 10_000)))
            .unwrap();

        for seq in 0..4 {
            conn.dispatch(pull("c", seq)).await.unwrap();
        }
        // Pulling past exhaustion is a no-op
        conn.dispatch(pull("c", 4)).await.unwrap();
        conn.dispatch(pull("c", 4)).await.unwrap();
        assert!(conn.get_value("c").is_none());
        assert_eq!(conn.stats().anomalies, 0);
        assert_eq!(conn.stats().chunks_sent, 3);
        assert_eq!(conn.stats().bytes_transferred, 25_000);
        drop(conn);

        let messages = read_all(remote).await;
        assert_eq!(messages.len(), 4);
        let sizes: Vec<_> = messages[..3]
            .iter()
            .map(|m| match m {
                Message::FileNodeChunk(c) => c.data.len(),
                other => panic!("Expected chunk, got {:?}", other),
            })
            .collect();
        assert_eq!(sizes, vec![10_000, 10_000, 5_000]);
        match &messages[3] {
            Message::FileNodeEndChunk(end) => assert_eq!(end.file_size, 25_000),
            other => panic!("Expected end marker, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_first_pull_opens_content() {
        let store = MemoryStore::new();
        store.insert_file(NodeRecord::new("n", "File", "n.bin"), vec![1u8; 8]);
        let (mut conn, _remote) = connection(Role::Server, store, 4);
        conn.insert_value("c", ContainerEntry::Outgoing(ChunkCursor::new("c", "n", 8, 4)))
            .unwrap();

        let is_open = |conn: &Connection<DuplexStream>| match conn.get_value("c") {
            Some(ContainerEntry::Outgoing(cursor)) => cursor.is_open(),
            _ => panic!("cursor missing"),
        };
        assert!(!is_open(&conn));
        conn.dispatch(pull("c", 0)).await.unwrap();
        assert!(is_open(&conn));
        conn.dispatch(pull("c", 1)).await.unwrap();
        assert!(!is_open(&conn));
    }

    #[tokio::test]
    async fn test_content_vanishing_before_first_pull_is_storage_error() {
        let (mut conn, _remote) = connection(Role::Server, MemoryStore::new(), 4);
        conn.insert_value("c", ContainerEntry::Outgoing(ChunkCursor::new("c", "gone", 8, 4)))
            .unwrap();

        let err = conn.dispatch(pull("c", 0)).await.unwrap_err();
        assert!(matches!(err, SyncError::Storage(_)));
    }

    #[tokio::test]
    async fn test_files_are_pulled_one_at_a_time() {
        let store = MemoryStore::new();
        let (mut conn, mut remote) = connection(Role::Client, store.clone(), 1024);

        conn.dispatch(file_data("ca", "a", 3)).await.unwrap();
        conn.dispatch(file_data("cb", "b", 2)).await.unwrap();
        expect_pull(&mut remote, "ca", 0).await;
        assert_eq!(conn.stats().messages_sent, 1);

        // A chunk for the queued file arrives before it was pulled
        let (mut eager, _eager_remote) = connection(Role::Client, MemoryStore::new(), 1024);
        eager.dispatch(file_data("ca", "a", 3)).await.unwrap();
        eager.dispatch(file_data("cb", "b", 2)).await.unwrap();
        let err = eager.dispatch(file_chunk("cb", 0, 2, b"xy")).await.unwrap_err();
        assert!(matches!(err, SyncError::ProtocolViolation(_)));

        conn.dispatch(file_chunk("ca", 0, 3, b"abc")).await.unwrap();
        expect_pull(&mut remote, "ca", 1).await;
        conn.dispatch(end_chunk("ca", 3)).await.unwrap();
        expect_pull(&mut remote, "cb", 0).await;
        assert!(store.node("a").is_some());
        assert!(store.node("b").is_none());

        conn.dispatch(file_chunk("cb", 0, 2, b"xy")).await.unwrap();
        expect_pull(&mut remote, "cb", 1).await;
        conn.dispatch(end_chunk("cb", 2)).await.unwrap();
        assert_eq!(store.content("b").unwrap().as_ref(), b"xy");

        conn.dispatch(Message::End(End { count: 2 })).await.unwrap();
        match protocol::read_message(&mut remote).await.unwrap() {
            Some(Message::Finish(finish)) => assert_eq!(finish.objects, 2),
            other => panic!("Expected Finish, got {:?}", other),
        }
        assert!(conn.is_complete());
    }

    #[tokio::test]
    async fn test_file_node_stored_only_after_verification() {
        let store = MemoryStore::new();
        let (mut conn, _remote) = connection(Role::Client, store.clone(), 1024);

        conn.dispatch(file_data("c", "f", 10)).await.unwrap();
        assert!(store.node("f").is_none());

        conn.dispatch(file_chunk("c", 0, 10, b"short")).await.unwrap();
        let err = conn.dispatch(end_chunk("c", 10)).await.unwrap_err();
        assert!(matches!(err, SyncError::Integrity { .. }));
        assert!(store.node("f").is_none());
        assert!(store.content("f").is_none());
    }

    #[tokio::test]
    async fn test_pull_for_unregistered_container_is_anomaly() {
        let (mut conn, remote) = connection(Role::Server, MemoryStore::new(), 1024);

        conn.dispatch(pull("never-registered", 0)).await.unwrap();
        assert_eq!(conn.stats().anomalies, 1);
        assert_eq!(conn.stats().messages_sent, 0);
        assert_eq!(conn.state(), SessionState::Active);
        drop(conn);

        assert!(read_all(remote).await.is_empty());
    }

    #[tokio::test]
    async fn test_out_of_sequence_pull_rejected() {
        let (mut conn, _remote) = connection(Role::Server, MemoryStore::new(), 10);
        conn.insert_value("c", cursor("c", vec![0u8; 30], 10)).unwrap();

        let err = conn.dispatch(pull("c", 2)).await.unwrap_err();
        assert!(matches!(err, SyncError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_duplicate_container_rejected() {
        let (mut conn, _remote) = connection(Role::Server, MemoryStore::new(), 10);
        conn.insert_value("c", cursor("c", vec![0u8; 5], 10)).unwrap();
        let err = conn.insert_value("c", cursor("c", vec![1u8; 5], 10)).unwrap_err();
        assert!(matches!(err, SyncError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_containers_are_connection_scoped() {
        let (mut first, _r1) = connection(Role::Server, MemoryStore::new(), 10);
        let (second, _r2) = connection(Role::Server, MemoryStore::new(), 10);

        first.insert_value("shared-id", cursor("shared-id", vec![0u8; 5], 10)).unwrap();
        assert!(first.get_value("shared-id").is_some());
        assert!(second.get_value("shared-id").is_none());
    }

    #[tokio::test]
    async fn test_chunk_for_unknown_container_is_violation() {
        let (mut conn, _remote) = connection(Role::Client, MemoryStore::new(), 10);
        let err = conn
            .dispatch(Message::FileNodeChunk(FileNodeChunk {
                container_id: "ghost".to_string(),
                file_size: 1,
                sequence: 0,
                chunk_size: 10,
                data: bytes::Bytes::from_static(b"x"),
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (mut conn, _remote) = connection(Role::Client, MemoryStore::new(), 10);
        conn.close().await;
        let err = conn
            .send(Message::Finish(Finish { objects: 0 }))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Transport(_)));
        assert!(conn.insert_value("c", cursor("c", vec![], 10)).is_err());
    }

    #[tokio::test]
    async fn test_abort_reports_error_and_releases_containers() {
        let (mut conn, remote) = connection(Role::Server, MemoryStore::new(), 10);
        conn.insert_value("c", cursor("c", vec![0u8; 5], 10)).unwrap();

        conn.abort(&SyncError::protocol("bad peer")).await;
        assert_eq!(conn.state(), SessionState::Closed);
        assert!(conn.get_value("c").is_none());
        drop(conn);

        let messages = read_all(remote).await;
        match &messages[..] {
            [Message::Error(err)] => {
                assert_eq!(err.code, protocol::ErrorCode::ProtocolViolation);
                assert!(err.message.contains("bad peer"));
            }
            other => panic!("Expected one Error message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pull_session_between_two_connections() {
        let source = MemoryStore::new();
        source.insert_node(NodeRecord::new("site", "Site", "site"));
        source.insert_file(NodeRecord::new("logo", "File", "logo.png"), vec![3u8; 2_500]);
        source.insert_relationship(RelationshipRecord::new("r1", "CONTAINS", "site", "logo"));
        let dest = MemoryStore::new();

        let (client_io, server_io) = tokio::io::duplex(BUF);
        let config = TransferConfig {
            chunk_size: 1_000,
            progress_interval: 1,
            ..TransferConfig::default()
        };
        let mut server = Connection::new(server_io, Role::Server, Arc::new(source), config.clone());
        let mut client = Connection::new(client_io, Role::Client, Arc::new(dest.clone()), config);

        let (listener, mut events) = ChannelListener::new();
        client.set_listener(ListenerGuard::new(Box::new(listener)));

        let server_task = tokio::spawn(async move {
            server.run().await.map(|_| server.stats().clone())
        });

        client
            .send(Message::PullNode(PullNode {
                node_id: "site".to_string(),
                flags: protocol::PullFlags::RECURSIVE,
            }))
            .await
            .unwrap();
        client.run().await.unwrap();

        assert!(client.is_complete());
        assert_eq!(client.stats().objects_total, 3);
        assert_eq!(client.stats().objects_completed, 3);
        assert_eq!(client.stats().chunks_received, 3);
        assert_eq!(dest.content("logo").unwrap().len(), 2_500);
        assert!(dest.node("site").is_some());
        assert!(dest.relationship("r1").is_some());

        let server_stats = server_task.await.unwrap().unwrap();
        assert_eq!(server_stats.chunks_sent, 3);
        assert_eq!(server_stats.objects_completed, 3);

        let mut progress = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let TransmissionEvent::Progress { current, total } = event {
                progress.push((current, total));
            }
        }
        assert_eq!(progress, vec![(1, 3), (2, 3), (3, 3)]);
    }
}
