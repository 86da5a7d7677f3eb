//! Wire messages exchanged between host and guest.
//!
//! Every message has a numeric opcode ([`MessageKind`]) and a typed payload.
//! Transfer payloads (headers, data chunks, directory and file entries) have
//! the same shape in both directions and are shared via [`TransferMessage`].

use serde::{Deserialize, Serialize};

use super::capabilities::{ActionSet, DndAction, FormatList};
use crate::error::GuestRc;

/// Message opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum MessageKind {
    /// Guest connected and reports its protocol version
    Connect = 10,
    /// Guest disconnected
    Disconnect = 11,
    /// Guest reports feature flags
    ReportFeatures = 12,
    /// Guest polls for the next queued host message
    GetNextHostMessage = 300,
    /// Guest acknowledges an enter/move with its chosen action
    HgAckAction = 400,
    /// Guest names the format it wants after a drop
    HgRequestData = 401,
    /// Guest reports transfer progress
    HgProgress = 402,
    /// Guest answers a "drag pending?" query
    GhAckPending = 500,
    /// Guest sends the data header
    GhSendDataHeader = 501,
    /// Guest sends meta data
    GhSendData = 502,
    /// Guest reports an error
    GhError = 503,
    /// Guest sends a directory entry
    GhSendDirectory = 700,
    /// Guest sends file data
    GhSendFileData = 701,
    /// Guest sends a file header
    GhSendFileHeader = 702,
    /// Host sets the DnD mode
    SetMode = 100,
    /// Host: cursor entered a guest screen
    HgEnter = 200,
    /// Host: cursor moved
    HgMove = 201,
    /// Host: cursor left
    HgLeave = 202,
    /// Host: data dropped
    HgDrop = 203,
    /// Host: cancel the current operation
    HgCancel = 204,
    /// Host sends meta data
    HgSendData = 205,
    /// Host sends a directory entry
    HgSendDirectory = 207,
    /// Host sends file data
    HgSendFileData = 208,
    /// Host sends a file header
    HgSendFileHeader = 209,
    /// Host sends the data header
    HgSendDataHeader = 210,
    /// Host asks whether a guest drag is pending
    GhRequestPending = 600,
    /// Host: guest data was dropped on the host
    GhDropped = 601,
}

impl MessageKind {
    const ALL: [MessageKind; 27] = [
        MessageKind::Connect,
        MessageKind::Disconnect,
        MessageKind::ReportFeatures,
        MessageKind::GetNextHostMessage,
        MessageKind::HgAckAction,
        MessageKind::HgRequestData,
        MessageKind::HgProgress,
        MessageKind::GhAckPending,
        MessageKind::GhSendDataHeader,
        MessageKind::GhSendData,
        MessageKind::GhError,
        MessageKind::GhSendDirectory,
        MessageKind::GhSendFileData,
        MessageKind::GhSendFileHeader,
        MessageKind::SetMode,
        MessageKind::HgEnter,
        MessageKind::HgMove,
        MessageKind::HgLeave,
        MessageKind::HgDrop,
        MessageKind::HgCancel,
        MessageKind::HgSendData,
        MessageKind::HgSendDirectory,
        MessageKind::HgSendFileData,
        MessageKind::HgSendFileHeader,
        MessageKind::HgSendDataHeader,
        MessageKind::GhRequestPending,
        MessageKind::GhDropped,
    ];

    /// Numeric opcode
    pub fn id(self) -> u32 {
        self as u32
    }

    /// Look up an opcode
    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.id() == id)
    }

    /// Messages the session state handles itself before any registered callback
    pub fn is_core(self) -> bool {
        matches!(
            self,
            MessageKind::Connect
                | MessageKind::ReportFeatures
                | MessageKind::Disconnect
                | MessageKind::HgAckAction
                | MessageKind::HgRequestData
                | MessageKind::HgProgress
                | MessageKind::GhAckPending
        )
    }
}

/// Data header announcing a transfer (protocol v3+).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataHeader {
    /// Context ID (v3+)
    pub context_id: u32,
    /// Flags (unused)
    pub flags: u32,
    /// Screen the data belongs to
    pub screen_id: u32,
    /// Meta bytes plus all file bytes
    pub total_bytes: u64,
    /// Size of the meta payload
    pub meta_bytes: u64,
    /// Format of the meta payload
    pub meta_format: String,
    /// Number of directories and files
    pub objects: u64,
    /// Compression kind (unused)
    pub compression: u32,
    /// Checksum kind (unused)
    pub checksum_kind: u32,
    /// Checksum bytes (unused)
    pub checksum: Vec<u8>,
}

/// File header preceding file data (protocol v2+).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    /// Context ID (v3+)
    pub context_id: u32,
    /// Destination path relative to the drop root, `/`-separated
    pub path: String,
    /// Flags (unused)
    pub flags: u32,
    /// Mode bits
    pub mode: u32,
    /// File size in bytes
    pub size: u64,
}

/// Path and mode repeated in every v1 file data chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyFileInfo {
    /// Destination path relative to the drop root
    pub path: String,
    /// Mode bits
    pub mode: u32,
}

/// Transfer payloads shared by both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TransferMessage {
    /// Announces sizes and object count (v3+)
    DataHeader(DataHeader),
    /// Meta data chunk; `total_bytes` is only set by peers below v3
    Data {
        /// Context ID
        context_id: u32,
        /// Chunk
        data: Vec<u8>,
        /// Total transfer size (legacy)
        total_bytes: Option<u64>,
    },
    /// Directory entry
    Directory {
        /// Context ID
        context_id: u32,
        /// Relative path
        path: String,
        /// Mode bits
        mode: u32,
    },
    /// File header (v2+)
    FileHeader(FileHeader),
    /// File data chunk; `legacy` carries path and mode for v1 peers
    FileData {
        /// Context ID
        context_id: u32,
        /// Chunk
        data: Vec<u8>,
        /// Path and mode (v1 only)
        legacy: Option<LegacyFileInfo>,
    },
}

impl TransferMessage {
    /// Opcode when sent host → guest
    pub fn host_kind(&self) -> MessageKind {
        match self {
            TransferMessage::DataHeader(_) => MessageKind::HgSendDataHeader,
            TransferMessage::Data { .. } => MessageKind::HgSendData,
            TransferMessage::Directory { .. } => MessageKind::HgSendDirectory,
            TransferMessage::FileHeader(_) => MessageKind::HgSendFileHeader,
            TransferMessage::FileData { .. } => MessageKind::HgSendFileData,
        }
    }

    /// Opcode when sent guest → host
    pub fn guest_kind(&self) -> MessageKind {
        match self {
            TransferMessage::DataHeader(_) => MessageKind::GhSendDataHeader,
            TransferMessage::Data { .. } => MessageKind::GhSendData,
            TransferMessage::Directory { .. } => MessageKind::GhSendDirectory,
            TransferMessage::FileHeader(_) => MessageKind::GhSendFileHeader,
            TransferMessage::FileData { .. } => MessageKind::GhSendFileData,
        }
    }

    /// Parameter count for this payload at `protocol_version`
    pub fn param_count(&self, protocol_version: u32) -> u32 {
        let v3 = protocol_version >= 3;
        match self {
            TransferMessage::DataHeader(_) => 12,
            TransferMessage::Data { .. } => {
                if v3 {
                    5
                } else {
                    3
                }
            },
            TransferMessage::Directory { .. } => {
                if v3 {
                    4
                } else {
                    3
                }
            },
            TransferMessage::FileHeader(_) => 6,
            TransferMessage::FileData { legacy, .. } => match (legacy.is_some(), v3) {
                (true, _) => 5,
                (false, true) => 5,
                (false, false) => 3,
            },
        }
    }

    /// Payload bytes counted against the transfer accounting
    pub fn payload_len(&self) -> usize {
        match self {
            TransferMessage::Data { data, .. } | TransferMessage::FileData { data, .. } => {
                data.len()
            },
            _ => 0,
        }
    }
}

/// Host → guest messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    /// Set the DnD mode
    SetMode {
        /// Mode value
        mode: u32,
    },
    /// Cursor entered a guest screen
    Enter(DragEvent),
    /// Cursor moved over a guest screen
    Move(DragEvent),
    /// Cursor left the guest
    Leave,
    /// Data dropped on the guest
    Drop(DragEvent),
    /// Cancel the current operation
    Cancel,
    /// Transfer payload
    Transfer(TransferMessage),
    /// Ask whether a guest drag is pending
    GhRequestPending {
        /// Screen to query
        screen_id: u32,
    },
    /// Guest data was dropped on the host; guest should send it
    GhDropped {
        /// Requested format
        format: String,
        /// Chosen action
        action: DndAction,
    },
}

/// Enter/move/drop event payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DragEvent {
    /// Screen ID
    pub screen_id: u32,
    /// Cursor X (absolute)
    pub x: i32,
    /// Cursor Y (absolute)
    pub y: i32,
    /// Default action
    pub default_action: DndAction,
    /// Allowed actions
    pub allowed: ActionSet,
    /// Offered formats
    pub formats: FormatList,
}

impl HostMessage {
    /// Opcode
    pub fn kind(&self) -> MessageKind {
        match self {
            HostMessage::SetMode { .. } => MessageKind::SetMode,
            HostMessage::Enter(_) => MessageKind::HgEnter,
            HostMessage::Move(_) => MessageKind::HgMove,
            HostMessage::Leave => MessageKind::HgLeave,
            HostMessage::Drop(_) => MessageKind::HgDrop,
            HostMessage::Cancel => MessageKind::HgCancel,
            HostMessage::Transfer(t) => t.host_kind(),
            HostMessage::GhRequestPending { .. } => MessageKind::GhRequestPending,
            HostMessage::GhDropped { .. } => MessageKind::GhDropped,
        }
    }

    /// Parameter count at `protocol_version`
    pub fn param_count(&self, protocol_version: u32) -> u32 {
        let ctx = u32::from(protocol_version >= 3);
        match self {
            HostMessage::SetMode { .. } => 1,
            HostMessage::Enter(_) | HostMessage::Move(_) | HostMessage::Drop(_) => 7 + ctx,
            HostMessage::Leave | HostMessage::Cancel => ctx,
            HostMessage::Transfer(t) => t.param_count(protocol_version),
            HostMessage::GhRequestPending { .. } => 1 + ctx,
            HostMessage::GhDropped { .. } => 3 + ctx,
        }
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Guest → host messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuestMessage {
    /// Guest connected
    Connect {
        /// Protocol version the guest speaks
        protocol_version: u32,
        /// Connection flags
        flags: u32,
    },
    /// Guest disconnected
    Disconnect,
    /// Guest feature flags
    ReportFeatures {
        /// Feature bits
        features: u64,
    },
    /// Poll for the next queued host message
    GetNextHostMessage {
        /// Kind the guest expects next, if it has a preference
        expected: Option<MessageKind>,
        /// Parameter count the guest expects
        param_count: Option<u32>,
    },
    /// Chosen action after enter/move
    HgAckAction {
        /// Action
        action: DndAction,
    },
    /// Formats the guest wants after a drop (separator-joined)
    HgRequestData {
        /// Wire format string
        formats: String,
    },
    /// Transfer progress
    HgProgress {
        /// Progress status
        status: ProgressState,
        /// Percentage 0..=100
        percent: u8,
        /// Inner status code
        rc: GuestRc,
    },
    /// Answer to a pending query
    GhAckPending {
        /// Default action
        default_action: DndAction,
        /// Allowed actions
        allowed: ActionSet,
        /// Offered formats
        formats: FormatList,
    },
    /// Guest-side error
    GhError {
        /// Status code
        rc: GuestRc,
    },
    /// Transfer payload
    Transfer(TransferMessage),
}

impl GuestMessage {
    /// Opcode
    pub fn kind(&self) -> MessageKind {
        match self {
            GuestMessage::Connect { .. } => MessageKind::Connect,
            GuestMessage::Disconnect => MessageKind::Disconnect,
            GuestMessage::ReportFeatures { .. } => MessageKind::ReportFeatures,
            GuestMessage::GetNextHostMessage { .. } => MessageKind::GetNextHostMessage,
            GuestMessage::HgAckAction { .. } => MessageKind::HgAckAction,
            GuestMessage::HgRequestData { .. } => MessageKind::HgRequestData,
            GuestMessage::HgProgress { .. } => MessageKind::HgProgress,
            GuestMessage::GhAckPending { .. } => MessageKind::GhAckPending,
            GuestMessage::GhError { .. } => MessageKind::GhError,
            GuestMessage::Transfer(t) => t.guest_kind(),
        }
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Progress status as reported by the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressState {
    /// Transfer running
    Running = 1,
    /// Transfer complete
    Complete = 2,
    /// Transfer cancelled
    Cancelled = 3,
    /// Transfer failed
    Error = 4,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_ids() {
        assert_eq!(MessageKind::HgSendDataHeader.id(), 210);
        assert_eq!(MessageKind::from_id(701), Some(MessageKind::GhSendFileData));
        assert_eq!(MessageKind::from_id(9999), None);
    }

    #[test]
    fn test_core_kinds() {
        assert!(MessageKind::Connect.is_core());
        assert!(MessageKind::GhAckPending.is_core());
        assert!(!MessageKind::GhSendData.is_core());
        assert!(!MessageKind::GetNextHostMessage.is_core());
    }

    #[test]
    fn test_transfer_kind_per_direction() {
        let msg = TransferMessage::Directory {
            context_id: 0,
            path: "a".to_string(),
            mode: 0o755,
        };
        assert_eq!(HostMessage::Transfer(msg.clone()).kind(), MessageKind::HgSendDirectory);
        assert_eq!(GuestMessage::Transfer(msg).kind(), MessageKind::GhSendDirectory);
    }

    #[test]
    fn test_file_data_params_depend_on_version() {
        let chunk = TransferMessage::FileData {
            context_id: 0,
            data: vec![1, 2, 3],
            legacy: None,
        };
        assert_eq!(chunk.param_count(2), 3);
        assert_eq!(chunk.param_count(3), 5);
        assert_eq!(chunk.payload_len(), 3);
    }

    #[test]
    fn test_host_message_json() {
        let msg = HostMessage::GhDropped {
            format: "text/plain".to_string(),
            action: DndAction::Copy,
        };
        let json = msg.to_json().unwrap();
        assert!(json.contains("gh_dropped"));
        assert_eq!(HostMessage::from_json(&json).unwrap(), msg);
    }
}
