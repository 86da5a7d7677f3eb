//! Drag actions and format lists negotiated between host and guest.
//!
//! Both sides advertise what they can do (allowed actions, offered formats)
//! and the receiving side picks from the intersection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// MIME type for file/directory transfer lists.
pub const MIME_URI_LIST: &str = "text/uri-list";

/// Plain text.
pub const MIME_TEXT_PLAIN: &str = "text/plain";

/// Plain text, UTF-8.
pub const MIME_TEXT_PLAIN_UTF8: &str = "text/plain;charset=utf-8";

/// Separator for format lists on the wire.
pub const FORMATS_SEPARATOR: &str = "\r\n";

/// X11 selection housekeeping targets that carry no data.
pub const X11_HOUSEKEEPING_FORMATS: [&str; 2] = ["TARGETS", "MULTIPLE"];

const TEXT_FORMATS: &[&str] = &[
    MIME_TEXT_PLAIN_UTF8,
    MIME_TEXT_PLAIN,
    "UTF8_STRING",
    "STRING",
    "TEXT",
    "text/richtext",
    "text/html",
];

/// Formats the host can handle by default.
const HOST_FORMATS: &[&str] = &[
    MIME_URI_LIST,
    MIME_TEXT_PLAIN_UTF8,
    MIME_TEXT_PLAIN,
    "UTF8_STRING",
    "STRING",
    "TEXT",
    "text/richtext",
    "text/html",
    "image/png",
    "image/bmp",
];

/// A single drag action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DndAction {
    /// No drop possible
    #[default]
    Ignore,
    /// Copy the data
    Copy,
    /// Move the data
    Move,
    /// Link to the data
    Link,
}

impl DndAction {
    /// Wire bit for this action (0 for ignore).
    pub fn bits(self) -> u32 {
        match self {
            DndAction::Ignore => 0,
            DndAction::Copy => 1 << 0,
            DndAction::Move => 1 << 1,
            DndAction::Link => 1 << 2,
        }
    }

    /// Pick the preferred action contained in a wire bit mask.
    pub fn from_bits(bits: u32) -> Self {
        ActionSet::from_bits(bits).default_action()
    }

    /// Get descriptive name.
    pub fn name(self) -> &'static str {
        match self {
            DndAction::Ignore => "ignore",
            DndAction::Copy => "copy",
            DndAction::Move => "move",
            DndAction::Link => "link",
        }
    }
}

impl fmt::Display for DndAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for DndAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ignore" | "none" => Ok(Self::Ignore),
            "copy" => Ok(Self::Copy),
            "move" => Ok(Self::Move),
            "link" => Ok(Self::Link),
            _ => Err(format!("Unknown action: {}", s)),
        }
    }
}

/// Set of allowed actions, carried on the wire as a bit mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ActionSet(u32);

impl ActionSet {
    const KNOWN: u32 = 0b111;

    /// Empty set (ignore only).
    pub const NONE: ActionSet = ActionSet(0);

    /// Build from wire bits, dropping unknown bits.
    pub fn from_bits(bits: u32) -> Self {
        Self(bits & Self::KNOWN)
    }

    /// Wire bits.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Check if `action` is allowed. Ignore is always allowed.
    pub fn contains(self, action: DndAction) -> bool {
        action == DndAction::Ignore || self.0 & action.bits() != 0
    }

    /// Add an action.
    pub fn insert(&mut self, action: DndAction) {
        self.0 |= action.bits();
    }

    /// Check if no real action is allowed.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Intersection of two sets.
    pub fn intersect(self, other: ActionSet) -> ActionSet {
        ActionSet(self.0 & other.0)
    }

    /// Preferred action in the set: copy, then move, then link.
    pub fn default_action(self) -> DndAction {
        [DndAction::Copy, DndAction::Move, DndAction::Link]
            .into_iter()
            .find(|a| self.0 & a.bits() != 0)
            .unwrap_or(DndAction::Ignore)
    }

    /// Resolve the action to use: `requested` when allowed, otherwise the
    /// preferred allowed one.
    pub fn resolve(self, requested: DndAction) -> DndAction {
        if requested != DndAction::Ignore && self.contains(requested) {
            requested
        } else {
            self.default_action()
        }
    }
}

impl FromIterator<DndAction> for ActionSet {
    fn from_iter<I: IntoIterator<Item = DndAction>>(iter: I) -> Self {
        let mut set = ActionSet::NONE;
        for action in iter {
            set.insert(action);
        }
        set
    }
}

/// Ordered list of MIME-style format names without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatList(Vec<String>);

impl FormatList {
    /// Create an empty list
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Formats the host supports out of the box
    pub fn host_supported() -> Self {
        HOST_FORMATS.iter().copied().collect()
    }

    /// Parse a wire string (separator-joined, empty entries dropped)
    pub fn from_wire(wire: &str) -> Self {
        wire.split(FORMATS_SEPARATOR)
            .flat_map(|part| part.split('\n'))
            .map(|f| f.trim_matches(|c| c == '\r' || c == '\0' || c == ' '))
            .filter(|f| !f.is_empty())
            .collect()
    }

    /// Join into a wire string
    pub fn to_wire(&self) -> String {
        self.0.join(FORMATS_SEPARATOR)
    }

    /// Append a format if not already present
    pub fn push(&mut self, format: impl Into<String>) {
        let format = format.into();
        if !self.contains(&format) {
            self.0.push(format);
        }
    }

    /// Check if a format is in the list (case-insensitive)
    pub fn contains(&self, format: &str) -> bool {
        self.0.iter().any(|f| f.eq_ignore_ascii_case(format))
    }

    /// Check if the list announces a transfer list
    pub fn contains_uri_list(&self) -> bool {
        self.contains(MIME_URI_LIST)
    }

    /// Check if the list holds a text format
    pub fn contains_text(&self) -> bool {
        self.0.iter().any(|f| is_text_format(f))
    }

    /// Formats present in both lists, in our order
    pub fn intersect(&self, other: &FormatList) -> FormatList {
        self.0
            .iter()
            .filter(|f| other.contains(f))
            .cloned()
            .collect()
    }

    /// True when the list is non-empty and holds nothing but X11 selection
    /// housekeeping targets.
    pub fn is_x11_housekeeping_only(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .iter()
                .all(|f| X11_HOUSEKEEPING_FORMATS.iter().any(|h| h == f))
    }

    /// Number of formats
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check for emptiness
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First format, if any
    pub fn first(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// Iterate formats
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for FormatList {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut list = FormatList::new();
        for f in iter {
            list.push(f);
        }
        list
    }
}

impl fmt::Display for FormatList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(", "))
    }
}

/// Check whether a format names a transfer list
pub fn is_uri_list_format(format: &str) -> bool {
    format.eq_ignore_ascii_case(MIME_URI_LIST)
}

/// Check whether a format names plain or rich text
pub fn is_text_format(format: &str) -> bool {
    TEXT_FORMATS.iter().any(|t| t.eq_ignore_ascii_case(format))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_bits_roundtrip() {
        for action in [DndAction::Copy, DndAction::Move, DndAction::Link] {
            assert_eq!(DndAction::from_bits(action.bits()), action);
        }
        assert_eq!(DndAction::from_bits(0), DndAction::Ignore);
    }

    #[test]
    fn test_action_set_preference() {
        let set: ActionSet = [DndAction::Link, DndAction::Move].into_iter().collect();
        assert_eq!(set.default_action(), DndAction::Move);
        assert_eq!(set.resolve(DndAction::Link), DndAction::Link);
        assert_eq!(set.resolve(DndAction::Copy), DndAction::Move);
        assert_eq!(ActionSet::NONE.resolve(DndAction::Copy), DndAction::Ignore);
    }

    #[test]
    fn test_action_set_drops_unknown_bits() {
        assert_eq!(ActionSet::from_bits(0xff).bits(), 0b111);
    }

    #[test]
    fn test_format_list_wire() {
        let list = FormatList::from_wire("text/uri-list\r\ntext/plain\r\n\r\ntext/plain");
        assert_eq!(list.len(), 2);
        assert_eq!(list.to_wire(), "text/uri-list\r\ntext/plain");
        assert!(list.contains_uri_list());
    }

    #[test]
    fn test_format_list_intersect_keeps_order() {
        let ours: FormatList = ["text/plain", "text/uri-list"].into_iter().collect();
        let theirs: FormatList = ["TEXT/URI-LIST", "image/png", "text/plain"]
            .into_iter()
            .collect();
        let common = ours.intersect(&theirs);
        assert_eq!(common.iter().collect::<Vec<_>>(), vec!["text/plain", "text/uri-list"]);
    }

    #[test]
    fn test_x11_housekeeping_only() {
        let list: FormatList = ["TARGETS", "MULTIPLE"].into_iter().collect();
        assert!(list.is_x11_housekeeping_only());
        let list: FormatList = ["TARGETS", "text/plain"].into_iter().collect();
        assert!(!list.is_x11_housekeeping_only());
        assert!(!FormatList::new().is_x11_housekeeping_only());
    }
}
