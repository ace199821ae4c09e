//! Wire protocol for cloud sync.
//!
//! Message-command model: every frame carries one [`Message`] variant, and
//! the receiving [`Connection`](crate::connection::Connection) dispatches it
//! by tag. File content moves in pull-paced chunks:
//!
//! ```text
//! consumer                          producer
//!    |  <------ FileNodeData -------   |   (cursor registered)
//!    |  ------- PullChunk(0) ------>   |
//!    |  <------ FileNodeChunk(0) ---   |
//!    |  ------- PullChunk(1) ------>   |
//!    |            ...                  |
//!    |  <------ FileNodeEndChunk ---   |   (cursor removed)
//! ```

pub mod auth;
pub mod frame;
pub mod message;

pub use auth::{authentication_request, password_digest, Authenticator};
pub use frame::{read_frame, read_message, write_frame, MAX_FRAME_SIZE};
pub use message::{
    AuthenticationRequest, AuthenticationResponse, Begin, End, ErrorCode, FileNodeChunk,
    FileNodeData, FileNodeEndChunk, Finish, ListSyncables, Message, MessageType, NodeData,
    PullChunk, PullFlags, PullNode, RelationshipData, RemoteError, SyncableList,
    FRAME_HEADER_SIZE, MAX_STR_LEN, PROTOCOL_VERSION,
};
