//! # DnD Core - Guest/Host Drag-and-Drop Transfers
//!
//! Host side of a drag-and-drop protocol between a virtual machine guest and
//! its host. Data moves in both directions over a host-call channel: raw
//! clipboard-style payloads, or whole file trees announced as a
//! `text/uri-list` and streamed object by object.
//!
//! ## Features
//!
//! - **Bidirectional**: [`Target`] drags host data into the guest, [`Source`]
//!   pulls a guest drag onto the host
//! - **Chunked transfers**: size-accounted data header, meta data, directories
//!   and file chunks with per-version wire differences (v1..v3)
//! - **Cancelable**: every transfer reports through a [`Progress`] handle and
//!   can be cancelled from either side
//! - **Safe staging**: received files land in a private staging directory
//!   that is rolled back unless the transfer completes
//!
//! ## Architecture
//!
//! ```text
//!  Host UI                    DndManager                       Guest
//!    |                            |                              |
//!    |-- Target::enter ---------->|------- HgEnter ------------->|
//!    |                            |<------ HgAckAction ----------|
//!    |-- Target::drop ----------->|------- HgDrop -------------->|
//!    |                            |<------ HgRequestData --------|
//!    |-- Target::send_data ------>|======= HgSend* ============>|
//!    |                            |<------ GetNextHostMessage ---|
//!    |                            |                              |
//!    |-- Source::drag_is_pending->|------- GhRequestPending ---->|
//!    |                            |<------ GhAckPending ---------|
//!    |-- Source::drop ----------->|------- GhDropped ----------->|
//!    |                            |<====== GhSend* ==============|
//! ```
//!
//! ### Session States
//!
//! | State           | Entered by                           |
//! |-----------------|--------------------------------------|
//! | Unknown         | reset, disconnect                    |
//! | Entered         | host cursor entered a guest screen   |
//! | Dragging        | guest acknowledged an action         |
//! | QueryFormats    | guest answered a pending query       |
//! | DropEnded       | transfer finished successfully       |
//! | LeftAfterDrag   | host cursor left during a drag       |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dnd::{Config, DndManager, Target};
//! use dnd::protocol::{ActionSet, DndAction, FormatList, MIME_TEXT_PLAIN};
//!
//! let manager = DndManager::new(Config::default(), transport);
//! let target = Target::new(&manager);
//! let formats: FormatList = [MIME_TEXT_PLAIN].into_iter().collect();
//! let allowed: ActionSet = [DndAction::Copy].into_iter().collect();
//!
//! target.enter(0, 10, 10, DndAction::Copy, allowed, &formats).await?;
//! let dropped = target.drop(0, 10, 10, DndAction::Copy, allowed, &formats).await?;
//! let progress = target.send_data(0, &dropped.format, b"hello".to_vec())?;
//! progress.wait().await;
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Message kinds, actions and format lists
//! - [`session`]: Shared state, callbacks, progress and events
//! - [`transfer`]: Accounting, meta buffer, transfer lists and staging
//! - [`transport`]: Host-call seam and the in-process loopback guest
//! - [`config`]: Configuration management
//! - [`error`]: Error types and guest status codes

pub mod config;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod session;
pub mod source;
pub mod target;
pub mod transfer;
pub mod transport;

// Re-exports for convenience
pub use config::Config;
pub use error::{DndError, GuestRc, Result};
pub use manager::DndManager;
pub use session::{DndState, Progress, ProgressOutcome, SessionState};
pub use source::{PendingDrag, Source};
pub use target::{DropResult, Target};
pub use transport::{GuestOffer, GuestOptions, HostCall, LoopbackGuest};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
