//! Transfer lists: directories and files queued for byte-level transfer.
//!
//! The sending side builds a list from local paths (depth-first, directories
//! before their contents). The receiving side only tracks how many objects
//! were announced and how many have been materialized.
//!
//! Root entries travel as a `text/uri-list` body:
//!
//! ```text
//! file:///a\r\n
//! file:///notes%20final.txt\r\n
//! ```

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{DndError, Result};
use crate::protocol::FORMATS_SEPARATOR;

const FILE_SCHEME: &str = "file://";

/// Kind of a transfer object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// Directory
    Directory,
    /// Regular file
    File,
}

/// One directory or file in a transfer list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferObject {
    /// Directory or file
    pub kind: ObjectKind,
    /// Absolute source path on the sending side
    pub source: PathBuf,
    /// Destination path relative to the drop root, `/`-separated
    pub dest: String,
    /// File size (0 for directories)
    pub size: u64,
    /// Mode bits
    pub mode: u32,
}

/// Ordered set of objects plus processing counters
#[derive(Debug, Clone, Default)]
pub struct TransferList {
    roots: Vec<String>,
    objects: Vec<TransferObject>,
    objects_to_process: u64,
    objects_processed: u64,
    enforce_count: bool,
}

impl TransferList {
    /// Build a sending list from local paths.
    ///
    /// Each path becomes a root entry named after its last component;
    /// directories are walked recursively in name order.
    pub fn from_paths<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut list = Self {
            enforce_count: true,
            ..Self::default()
        };

        for path in paths {
            let path = path.as_ref();
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    DndError::InvalidParameter(format!("{} has no file name", path.display()))
                })?;

            for entry in WalkDir::new(path).follow_links(false).sort_by_file_name() {
                let entry = entry.map_err(|e| {
                    let at = e.path().unwrap_or(path).to_path_buf();
                    match e.into_io_error() {
                        Some(io) => DndError::host_io(&io, &at),
                        None => DndError::host(format!("filesystem loop at {}", at.display())),
                    }
                })?;
                let rel = entry
                    .path()
                    .strip_prefix(path)
                    .map_err(|_| DndError::InvalidState("walked outside root".to_string()))?;
                let dest = join_dest(&name, rel);
                let meta = entry
                    .metadata()
                    .map_err(|e| DndError::host(format!("{}: {e}", entry.path().display())))?;

                let kind = if meta.is_dir() {
                    ObjectKind::Directory
                } else if meta.is_file() {
                    ObjectKind::File
                } else {
                    tracing::debug!(path = %entry.path().display(), "skipping special file");
                    continue;
                };

                list.objects.push(TransferObject {
                    kind,
                    source: entry.path().to_path_buf(),
                    dest,
                    size: if kind == ObjectKind::File { meta.len() } else { 0 },
                    mode: mode_bits(&meta, kind),
                });
            }
            list.roots.push(name);
        }

        list.objects_to_process = list.objects.len() as u64;
        Ok(list)
    }

    /// Build a sending list from a `text/uri-list` of local `file://` URIs
    pub fn from_uri_list(uri_list: &str) -> Result<Self> {
        let paths = parse_uri_list(uri_list)
            .into_iter()
            .map(PathBuf::from)
            .collect::<Vec<_>>();
        if paths.is_empty() {
            return Err(DndError::InvalidParameter("empty URI list".to_string()));
        }
        Self::from_paths(&paths)
    }

    /// Empty receiving list expecting `objects` entries
    pub fn for_receive(objects: u64) -> Self {
        Self {
            objects_to_process: objects,
            enforce_count: true,
            ..Self::default()
        }
    }

    /// Receiving list for peers that never announce an object count
    pub fn for_receive_unbounded() -> Self {
        Self::default()
    }

    /// Root entries as a `text/uri-list` body
    pub fn root_uri_list(&self) -> String {
        encode_uri_list(self.roots.iter().map(String::as_str))
    }

    /// Root entry names
    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    /// Objects in sending order
    pub fn objects(&self) -> &[TransferObject] {
        &self.objects
    }

    /// Total bytes of all files
    pub fn total_bytes(&self) -> u64 {
        self.objects.iter().map(|o| o.size).sum()
    }

    /// Objects announced
    pub fn objects_to_process(&self) -> u64 {
        self.objects_to_process
    }

    /// Objects completed
    pub fn objects_processed(&self) -> u64 {
        self.objects_processed
    }

    /// Check whether another object may still be processed
    pub fn ensure_capacity(&self) -> Result<()> {
        if self.enforce_count && self.objects_processed >= self.objects_to_process {
            return Err(DndError::TooMuchData(format!(
                "object count {} already reached",
                self.objects_to_process
            )));
        }
        Ok(())
    }

    /// Count one object as processed
    pub fn mark_processed(&mut self) -> Result<()> {
        self.ensure_capacity()?;
        self.objects_processed += 1;
        if !self.enforce_count {
            self.objects_to_process = self.objects_processed;
        }
        Ok(())
    }

    /// All announced objects have been processed
    pub fn is_complete(&self) -> bool {
        self.objects_processed == self.objects_to_process
    }

    /// Clear objects and counters
    pub fn reset(&mut self) {
        self.roots.clear();
        self.objects.clear();
        self.objects_to_process = 0;
        self.objects_processed = 0;
    }
}

fn join_dest(root: &str, rel: &Path) -> String {
    let mut dest = root.to_string();
    for comp in rel.components() {
        dest.push('/');
        dest.push_str(&comp.as_os_str().to_string_lossy());
    }
    dest
}

#[cfg(unix)]
fn mode_bits(meta: &std::fs::Metadata, _kind: ObjectKind) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn mode_bits(meta: &std::fs::Metadata, kind: ObjectKind) -> u32 {
    match (kind, meta.permissions().readonly()) {
        (ObjectKind::Directory, _) => 0o755,
        (ObjectKind::File, true) => 0o444,
        (ObjectKind::File, false) => 0o644,
    }
}

/// Encode paths as a `text/uri-list` body, percent-encoding each segment
pub fn encode_uri_list<'a>(paths: impl IntoIterator<Item = &'a str>) -> String {
    let mut out = String::new();
    for path in paths {
        out.push_str(&path_to_uri(path));
        out.push_str(FORMATS_SEPARATOR);
    }
    out
}

/// `file://` URI for a `/`-separated path
pub fn path_to_uri(path: &str) -> String {
    let path = path.replace('\\', "/");
    let encoded = path
        .trim_start_matches('/')
        .split('/')
        .map(|seg| urlencoding::encode(seg).into_owned())
        .collect::<Vec<_>>()
        .join("/");
    format!("{FILE_SCHEME}/{encoded}")
}

/// Decode a `text/uri-list` body into paths.
///
/// Comment lines and non-`file` URIs are skipped. Paths keep their leading
/// `/`; callers treating entries as relative strip it.
pub fn parse_uri_list(body: &str) -> Vec<String> {
    body.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|line| {
            let rest = line.strip_prefix(FILE_SCHEME)?;
            // file://host/path: drop the (usually empty) authority
            let path = match rest.find('/') {
                Some(idx) => &rest[idx..],
                None => return None,
            };
            match urlencoding::decode(path) {
                Ok(decoded) => Some(decoded.into_owned()),
                Err(e) => {
                    tracing::warn!(uri = line, error = %e, "skipping undecodable URI");
                    None
                },
            }
        })
        .collect()
}

/// Decode a root list body into relative root names
pub fn parse_root_list(body: &[u8]) -> Vec<String> {
    parse_uri_list(&String::from_utf8_lossy(body))
        .into_iter()
        .map(|p| p.trim_start_matches('/').to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn test_from_paths_depth_first() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("a");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("b.txt"), b"hello").unwrap();
        fs::write(root.join("sub").join("c.txt"), b"xy").unwrap();

        let list = TransferList::from_paths(&[&root]).unwrap();
        let dests: Vec<_> = list.objects().iter().map(|o| o.dest.as_str()).collect();
        assert_eq!(dests, vec!["a", "a/b.txt", "a/sub", "a/sub/c.txt"]);
        assert_eq!(list.objects_to_process(), 4);
        assert_eq!(list.total_bytes(), 7);
        assert_eq!(list.roots(), ["a".to_string()]);
    }

    #[test]
    fn test_uri_round_trip_with_spaces() {
        let body = encode_uri_list(["notes final.txt", "dir/ü"]);
        assert_eq!(body, "file:///notes%20final.txt\r\nfile:///dir/%C3%BC\r\n");
        assert_eq!(
            parse_root_list(body.as_bytes()),
            vec!["notes final.txt".to_string(), "dir/ü".to_string()]
        );
    }

    #[test]
    fn test_parse_skips_comments_and_foreign_schemes() {
        let body = "# comment\r\nhttp://example.com/x\r\nfile://localhost/tmp/x\r\n";
        assert_eq!(parse_uri_list(body), vec!["/tmp/x".to_string()]);
    }

    #[test]
    fn test_object_count_enforced_before_increment() {
        let mut list = TransferList::for_receive(1);
        list.mark_processed().unwrap();
        assert!(list.is_complete());
        assert!(matches!(list.mark_processed(), Err(DndError::TooMuchData(_))));
        assert_eq!(list.objects_processed(), 1);
    }

    #[test]
    fn test_unbounded_list_tracks_count() {
        let mut list = TransferList::for_receive_unbounded();
        list.mark_processed().unwrap();
        list.mark_processed().unwrap();
        assert_eq!(list.objects_to_process(), 2);
        assert!(list.is_complete());
    }

    #[test]
    fn test_from_uri_list_requires_entries() {
        assert!(TransferList::from_uri_list("# nothing\r\n").is_err());
    }
}
