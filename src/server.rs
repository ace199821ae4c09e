//! TCP sync server.
//!
//! Every accepted socket gets its own task, [`Connection`] and container
//! store. Sessions share nothing but the store, so a session that fails
//! (bad credentials, protocol violation, dropped socket) never affects the
//! others.

use crate::config::{SyncConfig, TransferConfig};
use crate::connection::{Connection, Role, SessionStats};
use crate::error::{Result, SyncError};
use crate::protocol::Authenticator;
use crate::store::SyncStore;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

pub struct CloudServer {
    listener: TcpListener,
    store: Arc<dyn SyncStore>,
    authenticator: Arc<Authenticator>,
    transfer: TransferConfig,
}

impl CloudServer {
    pub async fn bind(config: &SyncConfig, store: Arc<dyn SyncStore>) -> Result<Self> {
        config.validate()?;

        let addr = format!("{}:{}", config.server.bind, config.server.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| SyncError::Transport(format!("Cannot bind {}: {}", addr, e)))?;

        Ok(Self {
            listener,
            store,
            authenticator: Arc::new(Authenticator::new(
                config.server.username.clone(),
                &config.server.password,
            )),
            transfer: config.transfer.clone(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(SyncError::transport)
    }

    /// Accept connections forever.
    pub async fn serve(self) -> Result<()> {
        self.serve_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves. Sessions already
    /// running are left to finish on their own tasks.
    pub async fn serve_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Listening on {}", self.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                            continue;
                        }
                    };

                    let store = self.store.clone();
                    let authenticator = self.authenticator.clone();
                    let transfer = self.transfer.clone();
                    tokio::spawn(async move {
                        match handle_session(stream, store, &authenticator, transfer).await {
                            Ok(stats) => info!(
                                "Session {} complete: {} objects, {} bytes",
                                peer, stats.objects_completed, stats.bytes_transferred
                            ),
                            Err(e) => warn!("Session {} failed: {}", peer, e),
                        }
                    });
                }
            }
        }
    }
}

async fn handle_session(
    stream: TcpStream,
    store: Arc<dyn SyncStore>,
    authenticator: &Authenticator,
    transfer: TransferConfig,
) -> Result<SessionStats> {
    stream.set_nodelay(true).map_err(SyncError::transport)?;
    let mut conn = Connection::new(stream, Role::Server, store, transfer);

    let outcome = match conn.accept_authentication(authenticator).await {
        Ok(()) => {
            debug!("Session authenticated");
            conn.run().await
        }
        Err(e @ SyncError::Authentication(_)) => Err(e),
        Err(e) => {
            conn.abort(&e).await;
            Err(e)
        }
    };

    let stats = conn.stats().clone();
    conn.close().await;
    outcome.map(|_| stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{self, ErrorCode, ListSyncables, Message};
    use crate::store::MemoryStore;

    async fn start() -> SocketAddr {
        let mut config = SyncConfig::default();
        config.server.bind = "127.0.0.1".to_string();
        config.server.port = 0;

        let server = CloudServer::bind(&config, Arc::new(MemoryStore::new()))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.serve());
        addr
    }

    #[tokio::test]
    async fn test_first_message_must_authenticate() {
        let addr = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let request = Message::ListSyncables(ListSyncables::default());
        protocol::write_frame(&mut stream, &request.encode().unwrap()).await.unwrap();

        match protocol::read_message(&mut stream).await.unwrap() {
            Some(Message::Error(err)) => assert_eq!(err.code, ErrorCode::ProtocolViolation),
            other => panic!("Expected Error, got {:?}", other),
        }
        assert!(protocol::read_message(&mut stream).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejected_credentials_close_session() {
        let addr = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let request = Message::AuthenticationRequest(protocol::authentication_request("admin", "wrong"));
        protocol::write_frame(&mut stream, &request.encode().unwrap()).await.unwrap();

        match protocol::read_message(&mut stream).await.unwrap() {
            Some(Message::AuthenticationResponse(resp)) => assert!(!resp.accepted),
            other => panic!("Expected AuthenticationResponse, got {:?}", other),
        }
        assert!(protocol::read_message(&mut stream).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bind_rejects_invalid_config() {
        let mut config = SyncConfig::default();
        config.transfer.chunk_size = 0;
        let err = CloudServer::bind(&config, Arc::new(MemoryStore::new()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SyncError::Config(_)));
    }
}
