//! Host-call transport seam.
//!
//! The DnD core never talks to a guest directly. Outbound messages go
//! through a [`HostCall`] implementation; inbound messages come back through
//! [`DndManager::notify_dispatcher`](crate::DndManager::notify_dispatcher).
//!
//! ```text
//! ┌──────────────┐  host_call(HostMessage)   ┌──────────────┐
//! │  DndManager  │ ────────────────────────> │  HostCall    │
//! │  (Source,    │                           │  (transport) │
//! │   Target)    │ <──────────────────────── │              │
//! └──────────────┘  notify_dispatcher(msg)   └──────────────┘
//! ```
//!
//! [`LoopbackGuest`] is an in-process guest used by the CLI and tests.

mod loopback;

pub use loopback::{GuestOffer, GuestOptions, GuestStats, LoopbackGuest};

use crate::error::Result;
use crate::protocol::HostMessage;

/// Outbound host → guest channel.
///
/// Implementations deliver the message and return immediately; they never
/// wait for the guest to answer.
pub trait HostCall: Send + Sync {
    /// Deliver `msg` to the guest
    fn host_call(&self, msg: HostMessage) -> Result<()>;

    /// Transport name for logging
    fn name(&self) -> &'static str {
        "host-call"
    }
}
