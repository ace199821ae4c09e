//! Message types for the cloud sync protocol.
//!
//! Every protocol operation is one variant of [`Message`]. The variant tag is
//! the frame type byte; the payload layout is defined per variant below.
//!
//! Wire format: all multi-byte integers are big-endian.
//! Identifiers are length-prefixed (u16 len + UTF-8), free text and JSON
//! property maps are length-prefixed with a u32.
//! Frame format: len:u32 | type:u8 | payload

use crate::error::{Result, SyncError};
use crate::store::{NodeRecord, RelationshipRecord, SyncableInfo};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use super::frame::MAX_FRAME_SIZE;

/// Current protocol version
pub const PROTOCOL_VERSION: u16 = 1;

/// Frame header size: len(4) + type(1)
pub const FRAME_HEADER_SIZE: usize = 5;

/// Longest identifier a u16 length prefix can carry
pub const MAX_STR_LEN: usize = u16::MAX as usize;

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    AuthenticationRequest = 0x01,
    AuthenticationResponse = 0x02,
    ListSyncables = 0x03,
    SyncableList = 0x04,
    PullNode = 0x05,
    Begin = 0x06,
    NodeData = 0x07,
    RelationshipData = 0x08,
    FileNodeData = 0x09,
    PullChunk = 0x0A,
    FileNodeChunk = 0x0B,
    FileNodeEndChunk = 0x0C,
    End = 0x0D,
    Finish = 0x0E,
    Error = 0x0F,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::AuthenticationRequest),
            0x02 => Some(Self::AuthenticationResponse),
            0x03 => Some(Self::ListSyncables),
            0x04 => Some(Self::SyncableList),
            0x05 => Some(Self::PullNode),
            0x06 => Some(Self::Begin),
            0x07 => Some(Self::NodeData),
            0x08 => Some(Self::RelationshipData),
            0x09 => Some(Self::FileNodeData),
            0x0A => Some(Self::PullChunk),
            0x0B => Some(Self::FileNodeChunk),
            0x0C => Some(Self::FileNodeEndChunk),
            0x0D => Some(Self::End),
            0x0E => Some(Self::Finish),
            0x0F => Some(Self::Error),
            _ => None,
        }
    }
}

// =============================================================================
// Flags & codes
// =============================================================================

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PullFlags: u8 {
        /// Follow outgoing relationships from the requested node
        const RECURSIVE = 1 << 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    Internal = 1,
    AuthenticationFailed = 2,
    ProtocolViolation = 3,
    IntegrityFailed = 4,
    StorageFailed = 5,
    NotFound = 6,
}

impl ErrorCode {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(Self::Internal),
            2 => Some(Self::AuthenticationFailed),
            3 => Some(Self::ProtocolViolation),
            4 => Some(Self::IntegrityFailed),
            5 => Some(Self::StorageFailed),
            6 => Some(Self::NotFound),
            _ => None,
        }
    }
}

// =============================================================================
// Payload structs
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticationRequest {
    pub version: u16,
    pub username: String,
    /// Hex blake3 digest of the password
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticationResponse {
    pub accepted: bool,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ListSyncables {
    pub type_filter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SyncableList {
    pub entries: Vec<SyncableInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PullNode {
    pub node_id: String,
    pub flags: PullFlags,
}

impl PullNode {
    pub fn is_recursive(&self) -> bool {
        self.flags.contains(PullFlags::RECURSIVE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Begin {
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeData {
    pub node: NodeRecord,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipData {
    pub relationship: RelationshipRecord,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileNodeData {
    pub container_id: String,
    pub file_size: u64,
    pub node: NodeRecord,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PullChunk {
    pub container_id: String,
    pub sequence: u32,
    pub file_size: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileNodeChunk {
    pub container_id: String,
    pub file_size: u64,
    pub sequence: u32,
    /// Configured chunk size; `data` holds at most this many bytes
    pub chunk_size: u32,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileNodeEndChunk {
    pub container_id: String,
    pub file_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct End {
    pub count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Finish {
    pub objects: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    pub code: ErrorCode,
    pub message: String,
}

// =============================================================================
// Message
// =============================================================================

/// One protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    AuthenticationRequest(AuthenticationRequest),
    AuthenticationResponse(AuthenticationResponse),
    ListSyncables(ListSyncables),
    SyncableList(SyncableList),
    PullNode(PullNode),
    Begin(Begin),
    NodeData(NodeData),
    RelationshipData(RelationshipData),
    FileNodeData(FileNodeData),
    PullChunk(PullChunk),
    FileNodeChunk(FileNodeChunk),
    FileNodeEndChunk(FileNodeEndChunk),
    End(End),
    Finish(Finish),
    Error(RemoteError),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::AuthenticationRequest(_) => MessageType::AuthenticationRequest,
            Message::AuthenticationResponse(_) => MessageType::AuthenticationResponse,
            Message::ListSyncables(_) => MessageType::ListSyncables,
            Message::SyncableList(_) => MessageType::SyncableList,
            Message::PullNode(_) => MessageType::PullNode,
            Message::Begin(_) => MessageType::Begin,
            Message::NodeData(_) => MessageType::NodeData,
            Message::RelationshipData(_) => MessageType::RelationshipData,
            Message::FileNodeData(_) => MessageType::FileNodeData,
            Message::PullChunk(_) => MessageType::PullChunk,
            Message::FileNodeChunk(_) => MessageType::FileNodeChunk,
            Message::FileNodeEndChunk(_) => MessageType::FileNodeEndChunk,
            Message::End(_) => MessageType::End,
            Message::Finish(_) => MessageType::Finish,
            Message::Error(_) => MessageType::Error,
        }
    }

    /// Container this message belongs to, for chunk-stream variants.
    pub fn container_id(&self) -> Option<&str> {
        match self {
            Message::FileNodeData(m) => Some(&m.container_id),
            Message::PullChunk(m) => Some(&m.container_id),
            Message::FileNodeChunk(m) => Some(&m.container_id),
            Message::FileNodeEndChunk(m) => Some(&m.container_id),
            _ => None,
        }
    }

    /// Encode as a complete frame (header + payload).
    ///
    /// Fails if an identifier does not fit its u16 length prefix or the
    /// payload exceeds [`MAX_FRAME_SIZE`].
    pub fn encode(&self) -> Result<Bytes> {
        let mut payload = BytesMut::new();
        self.encode_payload(&mut payload)?;

        if payload.len() > MAX_FRAME_SIZE as usize {
            return Err(SyncError::protocol(format!(
                "{:?} payload of {} bytes exceeds maximum frame size {}",
                self.message_type(),
                payload.len(),
                MAX_FRAME_SIZE
            )));
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.put_u8(self.message_type() as u8);
        buf.put_slice(&payload);
        Ok(buf.freeze())
    }

    fn encode_payload(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            Message::AuthenticationRequest(m) => {
                buf.put_u16(m.version);
                put_str(buf, &m.username)?;
                put_str(buf, &m.digest)?;
            }
            Message::AuthenticationResponse(m) => {
                buf.put_u8(m.accepted as u8);
                put_text(buf, &m.reason);
            }
            Message::ListSyncables(m) => match &m.type_filter {
                Some(filter) => {
                    buf.put_u8(1);
                    put_str(buf, filter)?;
                }
                None => buf.put_u8(0),
            },
            Message::SyncableList(m) => {
                buf.put_u32(m.entries.len() as u32);
                for entry in &m.entries {
                    put_str(buf, &entry.id)?;
                    put_text(buf, &entry.name);
                    put_str(buf, &entry.node_type)?;
                    buf.put_u64(entry.size);
                    buf.put_u8(entry.is_file as u8);
                }
            }
            Message::PullNode(m) => {
                put_str(buf, &m.node_id)?;
                buf.put_u8(m.flags.bits());
            }
            Message::Begin(m) => buf.put_u64(m.total),
            Message::NodeData(m) => put_node(buf, &m.node)?,
            Message::RelationshipData(m) => {
                let rel = &m.relationship;
                put_str(buf, &rel.id)?;
                put_str(buf, &rel.rel_type)?;
                put_str(buf, &rel.source_id)?;
                put_str(buf, &rel.target_id)?;
                put_json(buf, &rel.properties);
            }
            Message::FileNodeData(m) => {
                put_str(buf, &m.container_id)?;
                buf.put_u64(m.file_size);
                put_node(buf, &m.node)?;
            }
            Message::PullChunk(m) => {
                put_str(buf, &m.container_id)?;
                buf.put_u32(m.sequence);
                buf.put_u64(m.file_size);
            }
            Message::FileNodeChunk(m) => {
                put_str(buf, &m.container_id)?;
                buf.put_u64(m.file_size);
                buf.put_u32(m.sequence);
                buf.put_u32(m.chunk_size);
                buf.put_u32(m.data.len() as u32);
                buf.put_slice(&m.data);
            }
            Message::FileNodeEndChunk(m) => {
                put_str(buf, &m.container_id)?;
                buf.put_u64(m.file_size);
            }
            Message::End(m) => buf.put_u64(m.count),
            Message::Finish(m) => buf.put_u64(m.objects),
            Message::Error(m) => {
                buf.put_u16(m.code as u16);
                put_text(buf, &m.message);
            }
        }
        Ok(())
    }

    /// Decode a payload (frame header already stripped).
    pub fn decode(msg_type: MessageType, mut payload: Bytes) -> Result<Self> {
        let p = &mut payload;
        let msg = match msg_type {
            MessageType::AuthenticationRequest => {
                need(p, 2, "AuthenticationRequest")?;
                let version = p.get_u16();
                Message::AuthenticationRequest(AuthenticationRequest {
                    version,
                    username: get_str(p, "AuthenticationRequest username")?,
                    digest: get_str(p, "AuthenticationRequest digest")?,
                })
            }
            MessageType::AuthenticationResponse => {
                need(p, 1, "AuthenticationResponse")?;
                let accepted = p.get_u8() != 0;
                Message::AuthenticationResponse(AuthenticationResponse {
                    accepted,
                    reason: get_text(p, "AuthenticationResponse reason")?,
                })
            }
            MessageType::ListSyncables => {
                need(p, 1, "ListSyncables")?;
                let type_filter = if p.get_u8() != 0 {
                    Some(get_str(p, "ListSyncables filter")?)
                } else {
                    None
                };
                Message::ListSyncables(ListSyncables { type_filter })
            }
            MessageType::SyncableList => {
                need(p, 4, "SyncableList")?;
                let count = p.get_u32() as usize;
                let mut entries = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let id = get_str(p, "SyncableList id")?;
                    let name = get_text(p, "SyncableList name")?;
                    let node_type = get_str(p, "SyncableList type")?;
                    need(p, 9, "SyncableList entry")?;
                    let size = p.get_u64();
                    let is_file = p.get_u8() != 0;
                    entries.push(SyncableInfo {
                        id,
                        name,
                        node_type,
                        size,
                        is_file,
                    });
                }
                Message::SyncableList(SyncableList { entries })
            }
            MessageType::PullNode => {
                let node_id = get_str(p, "PullNode id")?;
                need(p, 1, "PullNode flags")?;
                let flags = PullFlags::from_bits_truncate(p.get_u8());
                Message::PullNode(PullNode { node_id, flags })
            }
            MessageType::Begin => {
                need(p, 8, "Begin")?;
                Message::Begin(Begin { total: p.get_u64() })
            }
            MessageType::NodeData => Message::NodeData(NodeData {
                node: get_node(p)?,
            }),
            MessageType::RelationshipData => {
                let id = get_str(p, "RelationshipData id")?;
                let rel_type = get_str(p, "RelationshipData type")?;
                let source_id = get_str(p, "RelationshipData source")?;
                let target_id = get_str(p, "RelationshipData target")?;
                let properties = get_json(p, "RelationshipData properties")?;
                Message::RelationshipData(RelationshipData {
                    relationship: RelationshipRecord {
                        id,
                        rel_type,
                        source_id,
                        target_id,
                        properties,
                    },
                })
            }
            MessageType::FileNodeData => {
                let container_id = get_str(p, "FileNodeData container")?;
                need(p, 8, "FileNodeData size")?;
                let file_size = p.get_u64();
                let node = get_node(p)?;
                Message::FileNodeData(FileNodeData {
                    container_id,
                    file_size,
                    node,
                })
            }
            MessageType::PullChunk => {
                let container_id = get_str(p, "PullChunk container")?;
                need(p, 12, "PullChunk")?;
                let sequence = p.get_u32();
                let file_size = p.get_u64();
                Message::PullChunk(PullChunk {
                    container_id,
                    sequence,
                    file_size,
                })
            }
            MessageType::FileNodeChunk => {
                let container_id = get_str(p, "FileNodeChunk container")?;
                need(p, 20, "FileNodeChunk header")?;
                let file_size = p.get_u64();
                let sequence = p.get_u32();
                let chunk_size = p.get_u32();
                let data_len = p.get_u32() as usize;
                need(p, data_len, "FileNodeChunk data")?;
                let data = p.copy_to_bytes(data_len);
                Message::FileNodeChunk(FileNodeChunk {
                    container_id,
                    file_size,
                    sequence,
                    chunk_size,
                    data,
                })
            }
            MessageType::FileNodeEndChunk => {
                let container_id = get_str(p, "FileNodeEndChunk container")?;
                need(p, 8, "FileNodeEndChunk size")?;
                let file_size = p.get_u64();
                Message::FileNodeEndChunk(FileNodeEndChunk {
                    container_id,
                    file_size,
                })
            }
            MessageType::End => {
                need(p, 8, "End")?;
                Message::End(End { count: p.get_u64() })
            }
            MessageType::Finish => {
                need(p, 8, "Finish")?;
                Message::Finish(Finish {
                    objects: p.get_u64(),
                })
            }
            MessageType::Error => {
                need(p, 2, "Error")?;
                let code = ErrorCode::from_u16(p.get_u16()).unwrap_or(ErrorCode::Internal);
                Message::Error(RemoteError {
                    code,
                    message: get_text(p, "Error message")?,
                })
            }
        };
        Ok(msg)
    }
}

// =============================================================================
// Field helpers
// =============================================================================

fn put_str(buf: &mut BytesMut, s: &str) -> Result<()> {
    let len = u16::try_from(s.len()).map_err(|_| {
        SyncError::protocol(format!(
            "Identifier of {} bytes exceeds the {} byte limit",
            s.len(),
            MAX_STR_LEN
        ))
    })?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn put_text(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn put_json(buf: &mut BytesMut, value: &serde_json::Map<String, serde_json::Value>) {
    // Serializing a Map of Values cannot fail
    let text = serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string());
    put_text(buf, &text);
}

fn put_node(buf: &mut BytesMut, node: &NodeRecord) -> Result<()> {
    put_str(buf, &node.id)?;
    put_str(buf, &node.node_type)?;
    put_text(buf, &node.name);
    put_json(buf, &node.properties);
    Ok(())
}

fn need(buf: &Bytes, n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(SyncError::protocol(format!(
            "{} truncated: need {} bytes, have {}",
            what,
            n,
            buf.remaining()
        )));
    }
    Ok(())
}

fn get_str(buf: &mut Bytes, what: &str) -> Result<String> {
    need(buf, 2, what)?;
    let len = buf.get_u16() as usize;
    need(buf, len, what)?;
    String::from_utf8(buf.copy_to_bytes(len).to_vec())
        .map_err(|_| SyncError::protocol(format!("Invalid UTF-8 in {}", what)))
}

fn get_text(buf: &mut Bytes, what: &str) -> Result<String> {
    need(buf, 4, what)?;
    let len = buf.get_u32() as usize;
    need(buf, len, what)?;
    String::from_utf8(buf.copy_to_bytes(len).to_vec())
        .map_err(|_| SyncError::protocol(format!("Invalid UTF-8 in {}", what)))
}

fn get_json(buf: &mut Bytes, what: &str) -> Result<serde_json::Map<String, serde_json::Value>> {
    let text = get_text(buf, what)?;
    serde_json::from_str(&text)
        .map_err(|e| SyncError::protocol(format!("Invalid JSON in {}: {}", what, e)))
}

fn get_node(buf: &mut Bytes) -> Result<NodeRecord> {
    Ok(NodeRecord {
        id: get_str(buf, "node id")?,
        node_type: get_str(buf, "node type")?,
        name: get_text(buf, "node name")?,
        properties: get_json(buf, "node properties")?,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roundtrip(msg: &Message) -> Message {
        let encoded = msg.encode().unwrap();
        let msg_type = MessageType::from_u8(encoded[4]).unwrap();
        // Skip frame header (4 bytes len + 1 byte type)
        Message::decode(msg_type, encoded.slice(FRAME_HEADER_SIZE..)).unwrap()
    }

    #[test]
    fn test_frame_header() {
        let msg = Message::Begin(Begin { total: 7 });
        let encoded = msg.encode().unwrap();
        assert_eq!(encoded.len(), FRAME_HEADER_SIZE + 8);
        assert_eq!(u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]), 8);
        assert_eq!(encoded[4], MessageType::Begin as u8);
    }

    #[test]
    fn test_file_node_chunk_roundtrip() {
        let msg = Message::FileNodeChunk(FileNodeChunk {
            container_id: "c-1".to_string(),
            file_size: 25_000,
            sequence: 2,
            chunk_size: 10_000,
            data: Bytes::from(vec![7u8; 5_000]),
        });
        assert_eq!(roundtrip(&msg), msg);
        assert_eq!(msg.container_id(), Some("c-1"));
    }

    #[test]
    fn test_node_data_keeps_properties() {
        let mut properties = serde_json::Map::new();
        properties.insert("title".to_string(), json!("Home"));
        properties.insert("position".to_string(), json!(3));
        let msg = Message::NodeData(NodeData {
            node: NodeRecord {
                id: "n1".to_string(),
                node_type: "Page".to_string(),
                name: "home".to_string(),
                properties,
            },
        });

        match roundtrip(&msg) {
            Message::NodeData(data) => {
                assert_eq!(data.node.properties["title"], json!("Home"));
                assert_eq!(data.node.properties["position"], json!(3));
            }
            other => panic!("Expected NodeData, got {:?}", other),
        }
    }

    #[test]
    fn test_list_syncables_filter() {
        let msg = Message::ListSyncables(ListSyncables {
            type_filter: Some("Page".to_string()),
        });
        assert_eq!(roundtrip(&msg), msg);

        let msg = Message::ListSyncables(ListSyncables::default());
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_pull_node_flags() {
        let msg = Message::PullNode(PullNode {
            node_id: "root".to_string(),
            flags: PullFlags::RECURSIVE,
        });
        match roundtrip(&msg) {
            Message::PullNode(pull) => assert!(pull.is_recursive()),
            other => panic!("Expected PullNode, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_chunk_rejected() {
        let msg = Message::FileNodeChunk(FileNodeChunk {
            container_id: "c".to_string(),
            file_size: 10,
            sequence: 0,
            chunk_size: 10,
            data: Bytes::from_static(b"0123456789"),
        });
        let encoded = msg.encode().unwrap();
        let truncated = encoded.slice(FRAME_HEADER_SIZE..encoded.len() - 3);
        let err = Message::decode(MessageType::FileNodeChunk, truncated).unwrap_err();
        assert!(matches!(err, SyncError::ProtocolViolation(_)));
    }

    #[test]
    fn test_unknown_error_code_maps_to_internal() {
        let mut payload = BytesMut::new();
        payload.put_u16(999);
        payload.put_u32(2);
        payload.put_slice(b"hi");
        match Message::decode(MessageType::Error, payload.freeze()).unwrap() {
            Message::Error(err) => {
                assert_eq!(err.code, ErrorCode::Internal);
                assert_eq!(err.message, "hi");
            }
            other => panic!("Expected Error, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_identifier_is_rejected() {
        let msg = Message::PullNode(PullNode {
            node_id: "é".repeat(MAX_STR_LEN / 2 + 1),
            flags: PullFlags::empty(),
        });
        let err = msg.encode().unwrap_err();
        assert!(matches!(err, SyncError::ProtocolViolation(_)));

        let msg = Message::NodeData(NodeData {
            node: NodeRecord::new("n".repeat(MAX_STR_LEN + 1), "Page", "big"),
        });
        assert!(msg.encode().is_err());

        let msg = Message::PullNode(PullNode {
            node_id: "n".repeat(MAX_STR_LEN),
            flags: PullFlags::empty(),
        });
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_message_type_from_u8() {
        assert_eq!(MessageType::from_u8(0x0A), Some(MessageType::PullChunk));
        assert_eq!(MessageType::from_u8(0x0F), Some(MessageType::Error));
        assert_eq!(MessageType::from_u8(0x00), None);
        assert_eq!(MessageType::from_u8(0x10), None);
    }
}
