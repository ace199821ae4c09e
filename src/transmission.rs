//! Transmission coordinator.
//!
//! A [`Transmission`] is one logical synchronization run: credentials, a
//! target, and the action that opens the session. [`run_transmission`] owns
//! the whole connection lifecycle and reports it to a listener:
//!
//! 1. `started()`, before anything touches the network
//! 2. connect (bounded by the connect timeout)
//! 3. authenticate; a rejection ends the run before any data moves
//! 4. send the initiating message (or, for a push, produce the subgraph)
//! 5. dispatch until the session completes or fails
//! 6. exactly one of `finished()` / `aborted(error)`

use crate::config::TransferConfig;
use crate::connection::{Connection, Role};
use crate::error::{Result, SyncError};
use crate::listener::{ListenerGuard, TransmissionListener};
use crate::protocol::{ListSyncables, Message, PullFlags, PullNode};
use crate::store::{collect_subgraph, MemoryStore, SyncStore, SyncableInfo};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransmissionKind {
    /// Send one message and let the peer drive the rest
    Single(Message),
    /// Produce a local subgraph for the peer to consume
    Push { node_id: String, recursive: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transmission {
    pub kind: TransmissionKind,
    pub credentials: Credentials,
    pub host: String,
    pub port: u16,
}

impl Transmission {
    pub fn single(initial_message: Message, credentials: Credentials, host: impl Into<String>, port: u16) -> Self {
        Self {
            kind: TransmissionKind::Single(initial_message),
            credentials,
            host: host.into(),
            port,
        }
    }

    pub fn pull(
        node_id: impl Into<String>,
        recursive: bool,
        credentials: Credentials,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        let flags = if recursive {
            PullFlags::RECURSIVE
        } else {
            PullFlags::empty()
        };
        let message = Message::PullNode(PullNode {
            node_id: node_id.into(),
            flags,
        });
        Self::single(message, credentials, host, port)
    }

    pub fn push(
        node_id: impl Into<String>,
        recursive: bool,
        credentials: Credentials,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            kind: TransmissionKind::Push {
                node_id: node_id.into(),
                recursive,
            },
            credentials,
            host: host.into(),
            port,
        }
    }

    pub fn list(
        type_filter: Option<String>,
        credentials: Credentials,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self::single(
            Message::ListSyncables(ListSyncables { type_filter }),
            credentials,
            host,
            port,
        )
    }
}

/// Aggregated outcome of a completed transmission.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransmissionResult {
    /// Nodes and relationships completed on this side
    pub objects_transferred: u64,
    /// Object count the peer confirmed with `Finish`, if it sent one
    pub objects_confirmed: Option<u64>,
    pub bytes_transferred: u64,
    pub chunks: u64,
    /// Listing returned by a `ListSyncables` run
    pub syncables: Vec<SyncableInfo>,
    pub anomalies: u64,
    pub duration: Duration,
}

/// Run one transmission against `store`.
///
/// Pulled entities are written to `store`; pushed ones are read from it.
pub async fn run_transmission(
    transmission: &Transmission,
    store: Arc<dyn SyncStore>,
    listener: Box<dyn TransmissionListener>,
    config: &TransferConfig,
) -> Result<TransmissionResult> {
    let mut guard = ListenerGuard::new(listener);
    guard.started();
    let start = Instant::now();

    let stream = match connect(&transmission.host, transmission.port, config.connect_timeout()).await {
        Ok(stream) => stream,
        Err(e) => {
            guard.aborted(&e);
            return Err(e);
        }
    };

    let mut conn = Connection::new(stream, Role::Client, store.clone(), config.clone());
    conn.set_listener(guard);

    let outcome = drive(&mut conn, transmission, store.as_ref()).await;

    let stats = conn.stats().clone();
    let result = TransmissionResult {
        objects_transferred: stats.objects_completed,
        objects_confirmed: conn.remote_objects(),
        bytes_transferred: stats.bytes_transferred,
        chunks: stats.chunks_sent + stats.chunks_received,
        syncables: conn.take_syncables(),
        anomalies: stats.anomalies,
        duration: start.elapsed(),
    };
    let guard = conn.take_listener();
    conn.close().await;

    let Some(mut guard) = guard else {
        return outcome.map(|_| result);
    };

    match outcome {
        Ok(()) => {
            info!(
                "Transmission to {}:{} complete: {} objects, {} bytes in {:?}",
                transmission.host,
                transmission.port,
                result.objects_transferred,
                result.bytes_transferred,
                result.duration
            );
            guard.finished();
            Ok(result)
        }
        Err(e) => {
            guard.aborted(&e);
            Err(e)
        }
    }
}

/// Single-message entry point.
///
/// Anything the peer sends back is held in a throwaway in-memory store; use
/// [`run_transmission`] to keep pulled entities.
pub async fn run_single(
    initial_message: Message,
    credentials: Credentials,
    host: &str,
    port: u16,
    listener: Box<dyn TransmissionListener>,
) -> Result<TransmissionResult> {
    let transmission = Transmission::single(initial_message, credentials, host, port);
    run_transmission(
        &transmission,
        Arc::new(MemoryStore::new()),
        listener,
        &TransferConfig::default(),
    )
    .await
}

async fn connect(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    debug!("Connecting to {}:{}", host, port);

    let unreachable = |reason: String| SyncError::Unreachable {
        host: host.to_string(),
        port,
        reason,
    };

    let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| unreachable(format!("timed out after {:?}", timeout)))?
        .map_err(|e| unreachable(e.to_string()))?;

    stream.set_nodelay(true).map_err(SyncError::transport)?;
    Ok(stream)
}

async fn drive<S>(
    conn: &mut Connection<S>,
    transmission: &Transmission,
    store: &dyn SyncStore,
) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    let credentials = &transmission.credentials;
    conn.authenticate(&credentials.username, &credentials.password)
        .await?;

    let initiated = match &transmission.kind {
        TransmissionKind::Single(message) => conn.send(message.clone()).await,
        TransmissionKind::Push { node_id, recursive } => {
            match collect_subgraph(store, node_id, *recursive).await {
                Ok(subgraph) => conn.produce(subgraph).await,
                Err(e) => Err(e),
            }
        }
    };

    if let Err(e) = initiated {
        conn.abort(&e).await;
        return Err(e);
    }

    conn.run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{ChannelListener, TransmissionEvent};

    #[test]
    fn test_pull_constructor_sets_flags() {
        let creds = Credentials::new("admin", "pw");
        let t = Transmission::pull("n1", true, creds.clone(), "localhost", 1);
        match t.kind {
            TransmissionKind::Single(Message::PullNode(pull)) => {
                assert_eq!(pull.node_id, "n1");
                assert!(pull.is_recursive());
            }
            other => panic!("Expected PullNode, got {:?}", other),
        }

        let t = Transmission::pull("n1", false, creds, "localhost", 1);
        match t.kind {
            TransmissionKind::Single(Message::PullNode(pull)) => assert!(!pull.is_recursive()),
            other => panic!("Expected PullNode, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_host_aborts() {
        // Bind then drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (events, mut rx) = ChannelListener::new();
        let err = run_single(
            Message::ListSyncables(ListSyncables::default()),
            Credentials::new("admin", "admin"),
            "127.0.0.1",
            port,
            Box::new(events),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SyncError::Unreachable { .. }));

        assert_eq!(rx.recv().await, Some(TransmissionEvent::Started));
        assert!(matches!(rx.recv().await, Some(TransmissionEvent::Aborted(_))));
        assert_eq!(rx.recv().await, None);
    }
}
