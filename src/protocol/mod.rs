//! Drag-and-drop wire protocol between host and guest.
//!
//! Messages travel over a narrow host-call channel: the host pushes
//! [`HostMessage`]s to the guest, the guest answers with [`GuestMessage`]s
//! delivered through the manager's dispatch entry point.
//!
//! # Message Flow
//!
//! ## Host → Guest (Target)
//!
//! ```text
//! Host                              Guest
//!   |------- ENTER (formats) -------->|
//!   |<------ ACK_ACTION (copy) -------|
//!   |------- MOVE ------------------->|
//!   |<------ ACK_ACTION --------------|
//!   |------- DROP ------------------->|
//!   |<------ REQUEST_DATA (format) ---|
//!   |------- DATA_HEADER (v3+) ------>|
//!   |<------ GET_NEXT_HOST_MSG -------|
//!   |------- DATA (meta) ------------>|
//!   |<------ GET_NEXT_HOST_MSG -------|
//!   |------- DIR / FILE_HDR / FILE_DATA ...
//! ```
//!
//! ## Guest → Host (Source)
//!
//! ```text
//! Host                              Guest
//!   |------- REQUEST_PENDING -------->|
//!   |<------ ACK_PENDING (formats) ---|
//!   |------- DROPPED (format) ------->|
//!   |<------ DATA_HEADER (v3+) -------|
//!   |<------ DATA (meta) -------------|
//!   |<------ DIR / FILE_HDR / FILE_DATA ...
//! ```
//!
//! ## Version Gates
//!
//! | Version | Change                                        |
//! |---------|-----------------------------------------------|
//! | 1       | File data chunks carry path and mode          |
//! | 2       | Separate file header before file data         |
//! | 3       | Data header, context IDs                      |

mod capabilities;
mod message;

pub use capabilities::{
    is_text_format, is_uri_list_format, ActionSet, DndAction, FormatList, FORMATS_SEPARATOR,
    MIME_TEXT_PLAIN, MIME_TEXT_PLAIN_UTF8, MIME_URI_LIST, X11_HOUSEKEEPING_FORMATS,
};
pub use message::{
    DataHeader, DragEvent, FileHeader, GuestMessage, HostMessage, LegacyFileInfo, MessageKind,
    ProgressState, TransferMessage,
};

/// Highest protocol version the host speaks
pub const PROTOCOL_VERSION: u32 = 3;

/// Protocol version that introduced separate file headers
pub const PROTOCOL_VERSION_FILE_HEADER: u32 = 2;

/// Protocol version that introduced data headers and context IDs
pub const PROTOCOL_VERSION_DATA_HEADER: u32 = 3;
