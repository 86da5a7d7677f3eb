//! Transfer bookkeeping and per-direction contexts.
//!
//! | Type | Role |
//! |------|------|
//! | [`MetaDataBuffer`] | Growable meta payload, hard-capped |
//! | [`TransferAccounting`] | Announced vs. processed bytes |
//! | [`TransferList`] | Directories and files, object counters |
//! | [`DroppedFiles`] | Staging directory, rollback unit |
//! | [`ReceiveContext`] | Applies incoming transfer messages |
//! | [`SendContext`] | Produces outgoing transfer messages |

mod accounting;
mod context;
mod list;
mod meta;
mod staging;

pub use accounting::TransferAccounting;
pub use context::{ReceiveContext, SendContext};
pub use list::{
    encode_uri_list, parse_root_list, parse_uri_list, path_to_uri, ObjectKind, TransferList,
    TransferObject,
};
pub use meta::MetaDataBuffer;
pub use staging::DroppedFiles;
