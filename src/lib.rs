//! graphsync - push and pull graph entities and their file content between
//! two instances over one TCP connection.
//!
//! ```no_run
//! use graphsync::{run_transmission, Credentials, DirectoryStore, LoggingListener, Transmission};
//! use std::sync::Arc;
//!
//! # async fn demo() -> graphsync::Result<()> {
//! let store = Arc::new(DirectoryStore::open("./replica").await?);
//! let pull = Transmission::pull("site", true, Credentials::new("admin", "admin"), "example.org", 54555);
//! let result = run_transmission(&pull, store, Box::new(LoggingListener), &Default::default()).await?;
//! println!("{} objects", result.objects_transferred);
//! # Ok(())
//! # }
//! ```

pub mod chunk;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod listener;
pub mod protocol;
pub mod server;
pub mod store;
pub mod transmission;

pub use config::SyncConfig;
pub use connection::{Connection, Role, SessionStats};
pub use error::{Result, SyncError};
pub use listener::{
    ChannelListener, ListenerGuard, LoggingListener, NoopListener, TransmissionEvent,
    TransmissionListener,
};
pub use protocol::Message;
pub use server::CloudServer;
pub use store::{DirectoryStore, MemoryStore, NodeRecord, RelationshipRecord, SyncStore};
pub use transmission::{
    run_single, run_transmission, Credentials, Transmission, TransmissionKind, TransmissionResult,
};
