//! DnD error types and guest status codes.
//!
//! Errors fall into the classes the transfer core distinguishes when it
//! finalizes an operation:
//!
//! - **Negotiation**: no common format, wrong number of formats from the guest
//! - **Guest-reported**: the guest pushed an error event with an inner status
//! - **Host-side**: local file I/O failed while materializing a transfer
//! - **Protocol violations**: out-of-order messages, bad sizes, too many objects
//! - **Timeouts**: no guest acknowledgement within budget
//!
//! Cancellation is modelled as [`DndError::Cancelled`] internally but never
//! surfaces as a failed progress object.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Signed status code as exchanged with the guest.
///
/// Non-negative values are success, negative values are failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct GuestRc(pub i32);

impl GuestRc {
    /// Success.
    pub const SUCCESS: GuestRc = GuestRc(0);
    /// Generic failure.
    pub const GENERAL_FAILURE: GuestRc = GuestRc(-1);
    /// Invalid parameter.
    pub const INVALID_PARAMETER: GuestRc = GuestRc(-2);
    /// Access denied.
    pub const ACCESS_DENIED: GuestRc = GuestRc(-38);
    /// Object not found.
    pub const NOT_FOUND: GuestRc = GuestRc(-78);
    /// Path not found.
    pub const PATH_NOT_FOUND: GuestRc = GuestRc(-103);
    /// File not found.
    pub const FILE_NOT_FOUND: GuestRc = GuestRc(-102);
    /// Sharing violation (file busy).
    pub const SHARING_VIOLATION: GuestRc = GuestRc(-29);
    /// Timed out.
    pub const TIMEOUT: GuestRc = GuestRc(-40);
    /// Cancelled.
    pub const CANCELLED: GuestRc = GuestRc(-70);
    /// Not supported.
    pub const NOT_SUPPORTED: GuestRc = GuestRc(-37);
    /// More data than announced.
    pub const TOO_MUCH_DATA: GuestRc = GuestRc(-42);
    /// Buffer limit exceeded.
    pub const BUFFER_OVERFLOW: GuestRc = GuestRc(-41);
    /// Nothing (more) available.
    pub const NOT_AVAILABLE: GuestRc = GuestRc(-1908);
    /// Disk full.
    pub const DISK_FULL: GuestRc = GuestRc(-152);
    /// Invalid state for the requested operation.
    pub const INVALID_STATE: GuestRc = GuestRc(-79);

    /// Check for success.
    pub fn is_success(self) -> bool {
        self.0 >= 0
    }

    /// Check for failure.
    pub fn is_failure(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for GuestRc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&std::io::Error> for GuestRc {
    fn from(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::PermissionDenied => GuestRc::ACCESS_DENIED,
            ErrorKind::NotFound => GuestRc::NOT_FOUND,
            ErrorKind::TimedOut => GuestRc::TIMEOUT,
            ErrorKind::InvalidInput => GuestRc::INVALID_PARAMETER,
            ErrorKind::Unsupported => GuestRc::NOT_SUPPORTED,
            ErrorKind::WriteZero | ErrorKind::OutOfMemory => GuestRc::DISK_FULL,
            _ => GuestRc::GENERAL_FAILURE,
        }
    }
}

/// Drag-and-drop transfer errors.
#[derive(Error, Debug)]
pub enum DndError {
    /// Parameter rejected before any state was touched.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Requested format or mode is not supported.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Guest acknowledged a drop with zero or several formats.
    #[error("Guest returned {0} formats, expected exactly one")]
    InvalidGuestFormats(usize),

    /// Another operation is pending on the same side.
    #[error("Operation already in progress")]
    AlreadyInProgress,

    /// Meta buffer would grow beyond its hard limit.
    #[error("Buffer overflow: {requested} bytes exceeds limit of {limit} bytes")]
    BufferOverflow {
        /// Bytes that would be held after the append.
        requested: usize,
        /// Hard limit.
        limit: usize,
    },

    /// More bytes or objects arrived than were announced.
    #[error("Too much data: {0}")]
    TooMuchData(String),

    /// No guest response within the budget.
    #[error("Timed out after {0} ms")]
    Timeout(u64),

    /// Operation was cancelled by the host or the guest.
    #[error("Operation cancelled")]
    Cancelled,

    /// Guest reported a failure.
    #[error("{message}")]
    Guest {
        /// Guest status code.
        rc: GuestRc,
        /// Translated message.
        message: String,
    },

    /// Host-side failure while materializing or reading transfer data.
    #[error("Host error: {message}")]
    Host {
        /// Mapped status code.
        rc: GuestRc,
        /// Translated message.
        message: String,
    },

    /// Message arrived out of order or with wrong parameters.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Nothing available (e.g. no queued host message).
    #[error("No more messages available")]
    NotAvailable,

    /// Operation not valid in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for DnD operations
pub type Result<T> = std::result::Result<T, DndError>;

impl DndError {
    /// Status code reported back over the wire for this error.
    pub fn rc(&self) -> GuestRc {
        match self {
            DndError::InvalidParameter(_) | DndError::Protocol(_) => GuestRc::INVALID_PARAMETER,
            DndError::NotSupported(_) | DndError::InvalidGuestFormats(_) => {
                GuestRc::NOT_SUPPORTED
            },
            DndError::AlreadyInProgress | DndError::InvalidState(_) => GuestRc::INVALID_STATE,
            DndError::BufferOverflow { .. } => GuestRc::BUFFER_OVERFLOW,
            DndError::TooMuchData(_) => GuestRc::TOO_MUCH_DATA,
            DndError::Timeout(_) => GuestRc::TIMEOUT,
            DndError::Cancelled => GuestRc::CANCELLED,
            DndError::Guest { rc, .. } | DndError::Host { rc, .. } => *rc,
            DndError::NotAvailable => GuestRc::NOT_AVAILABLE,
            DndError::Io(err) => GuestRc::from(err),
            DndError::Config(_) | DndError::Json(_) => GuestRc::GENERAL_FAILURE,
        }
    }

    /// Build a guest error with the translated message for `rc`.
    pub fn guest(rc: GuestRc) -> Self {
        if rc == GuestRc::CANCELLED {
            return DndError::Cancelled;
        }
        DndError::Guest {
            rc,
            message: translate_guest_error(rc),
        }
    }

    /// Build a host error without a more specific status.
    pub fn host(message: impl Into<String>) -> Self {
        DndError::Host {
            rc: GuestRc::GENERAL_FAILURE,
            message: message.into(),
        }
    }

    /// Build a host error from a local I/O failure, translated for display.
    pub fn host_io(err: &std::io::Error, path: &std::path::Path) -> Self {
        let rc = GuestRc::from(err);
        DndError::Host {
            rc,
            message: format!("{} ({})", translate_host_error(rc), path.display()),
        }
    }

    /// Whether this error came from the guest side.
    pub fn is_guest_error(&self) -> bool {
        matches!(self, DndError::Guest { .. })
    }

    /// Copy of this error for reporting through a second channel.
    ///
    /// I/O and JSON errors are not `Clone`; they are rebuilt from their kind
    /// and message.
    pub fn duplicate(&self) -> Self {
        match self {
            DndError::InvalidParameter(s) => DndError::InvalidParameter(s.clone()),
            DndError::NotSupported(s) => DndError::NotSupported(s.clone()),
            DndError::InvalidGuestFormats(n) => DndError::InvalidGuestFormats(*n),
            DndError::AlreadyInProgress => DndError::AlreadyInProgress,
            DndError::BufferOverflow { requested, limit } => DndError::BufferOverflow {
                requested: *requested,
                limit: *limit,
            },
            DndError::TooMuchData(s) => DndError::TooMuchData(s.clone()),
            DndError::Timeout(ms) => DndError::Timeout(*ms),
            DndError::Cancelled => DndError::Cancelled,
            DndError::Guest { rc, message } => DndError::Guest {
                rc: *rc,
                message: message.clone(),
            },
            DndError::Host { rc, message } => DndError::Host {
                rc: *rc,
                message: message.clone(),
            },
            DndError::Protocol(s) => DndError::Protocol(s.clone()),
            DndError::NotAvailable => DndError::NotAvailable,
            DndError::InvalidState(s) => DndError::InvalidState(s.clone()),
            DndError::Config(s) => DndError::Config(s.clone()),
            DndError::Json(e) => DndError::Protocol(e.to_string()),
            DndError::Io(e) => DndError::Io(std::io::Error::new(e.kind(), e.to_string())),
        }
    }
}

/// Translate a guest status code into a human-readable message.
pub fn translate_guest_error(rc: GuestRc) -> String {
    match rc {
        GuestRc::ACCESS_DENIED => "The guest user lacks access rights for one or more files \
                                   or directories selected for transfer to the host"
            .to_string(),
        GuestRc::NOT_FOUND | GuestRc::PATH_NOT_FOUND | GuestRc::FILE_NOT_FOUND => {
            "One or more files or directories selected for transfer to the host no longer \
             exist on the guest"
                .to_string()
        },
        GuestRc::SHARING_VIOLATION => "One or more files selected for transfer to the host are \
                                       in use by another application on the guest"
            .to_string(),
        GuestRc::TIMEOUT => "The guest did not provide the drag and drop data in time".to_string(),
        _ => format!("Drag and drop error from guest (code {rc})"),
    }
}

/// Translate a host-side status code into a human-readable message.
pub fn translate_host_error(rc: GuestRc) -> String {
    match rc {
        GuestRc::ACCESS_DENIED => {
            "The host user lacks access rights to write the dropped data".to_string()
        },
        GuestRc::NOT_FOUND | GuestRc::PATH_NOT_FOUND | GuestRc::FILE_NOT_FOUND => {
            "A file or directory needed for the transfer was not found on the host".to_string()
        },
        GuestRc::SHARING_VIOLATION => {
            "A file needed for the transfer is in use on the host".to_string()
        },
        GuestRc::DISK_FULL => "The host ran out of disk space during the transfer".to_string(),
        GuestRc::TIMEOUT => "The host timed out waiting for the transfer".to_string(),
        _ => format!("Drag and drop error on host (code {rc})"),
    }
}

impl From<toml::de::Error> for DndError {
    fn from(err: toml::de::Error) -> Self {
        DndError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guest_rc_sign() {
        assert!(GuestRc::SUCCESS.is_success());
        assert!(GuestRc(5).is_success());
        assert!(GuestRc::ACCESS_DENIED.is_failure());
    }

    #[test]
    fn test_translate_known_guest_errors() {
        assert!(translate_guest_error(GuestRc::ACCESS_DENIED).contains("access rights"));
        assert!(translate_guest_error(GuestRc::NOT_FOUND).contains("no longer"));
        assert!(translate_guest_error(GuestRc::SHARING_VIOLATION).contains("in use"));
        assert!(translate_guest_error(GuestRc::TIMEOUT).contains("in time"));
    }

    #[test]
    fn test_translate_unknown_guest_error() {
        let msg = translate_guest_error(GuestRc(-4242));
        assert_eq!(msg, "Drag and drop error from guest (code -4242)");
    }

    #[test]
    fn test_guest_cancel_is_not_an_error() {
        assert!(matches!(DndError::guest(GuestRc::CANCELLED), DndError::Cancelled));
        assert!(DndError::guest(GuestRc::ACCESS_DENIED).is_guest_error());
    }

    #[test]
    fn test_io_error_mapping() {
        let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(GuestRc::from(&err), GuestRc::ACCESS_DENIED);
        assert_eq!(DndError::Io(err).rc(), GuestRc::ACCESS_DENIED);
    }

    #[test]
    fn test_duplicate_keeps_rc() {
        let err = DndError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert_eq!(err.duplicate().rc(), err.rc());
        let err = DndError::InvalidParameter("chunk too large".to_string());
        assert!(matches!(err.duplicate(), DndError::InvalidParameter(s) if s == "chunk too large"));
    }

    #[test]
    fn test_host_io_keeps_status() {
        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err = DndError::host_io(&denied, std::path::Path::new("/x"));
        assert_eq!(err.rc(), GuestRc::ACCESS_DENIED);
        assert_eq!(err.duplicate().rc(), GuestRc::ACCESS_DENIED);
        assert!(err.to_string().contains("access rights"));
        assert!(err.to_string().contains("/x"));
        assert!(!err.is_guest_error());

        let full = std::io::Error::new(std::io::ErrorKind::WriteZero, "short write");
        assert_eq!(
            DndError::host_io(&full, std::path::Path::new("/y")).rc(),
            GuestRc::DISK_FULL
        );
        assert_eq!(DndError::host("stopped").rc(), GuestRc::GENERAL_FAILURE);
    }
}
