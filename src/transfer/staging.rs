//! Dropped-files staging area.
//!
//! Every transfer-list receive writes into a fresh `<base>/<uuid>` directory.
//! The directory is the rollback unit: on failure everything created under
//! it is removed, then the directory itself. Dropping an uncommitted staging
//! area rolls it back.

use std::fs::{self, File, OpenOptions};
use std::path::{Component, Path, PathBuf};

use uuid::Uuid;

use crate::error::{DndError, Result};

/// Staging directory for one receive operation
#[derive(Debug)]
pub struct DroppedFiles {
    root: PathBuf,
    created: Vec<PathBuf>,
    committed: bool,
    rolled_back: bool,
}

impl DroppedFiles {
    /// Create a fresh staging directory under `base`
    pub fn open(base: &Path) -> Result<Self> {
        fs::create_dir_all(base).map_err(|e| DndError::host_io(&e, base))?;
        let root = base.join(Uuid::new_v4().simple().to_string());
        fs::create_dir(&root).map_err(|e| DndError::host_io(&e, &root))?;
        tracing::debug!(root = %root.display(), "opened dropped files directory");

        Ok(Self {
            root,
            created: Vec::new(),
            committed: false,
            rolled_back: false,
        })
    }

    /// Staging root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Entries created so far
    pub fn created(&self) -> &[PathBuf] {
        &self.created
    }

    /// Resolve a `/`-separated relative path under the root.
    ///
    /// Absolute paths and `..` components are rejected.
    pub fn resolve(&self, rel: &str) -> Result<PathBuf> {
        let rel = rel.replace('\\', "/");
        if rel.starts_with('/') {
            return Err(DndError::InvalidParameter(format!("absolute path {rel}")));
        }

        let mut path = self.root.clone();
        let mut depth = 0;
        for comp in Path::new(&rel).components() {
            match comp {
                Component::Normal(seg) => {
                    path.push(seg);
                    depth += 1;
                },
                Component::CurDir => {},
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(DndError::InvalidParameter(format!(
                        "path {rel} escapes the drop directory"
                    )));
                },
            }
        }
        if depth == 0 {
            return Err(DndError::InvalidParameter("empty path".to_string()));
        }
        Ok(path)
    }

    /// Create a directory (and any missing parents) at `rel`
    pub fn add_directory(&mut self, rel: &str, mode: u32) -> Result<PathBuf> {
        let path = self.resolve(rel)?;
        self.create_dirs(&path)?;
        set_mode(&path, dir_mode(mode))?;
        Ok(path)
    }

    /// Create (or truncate) a file at `rel`, creating missing parents
    pub fn create_file(&mut self, rel: &str, mode: u32) -> Result<(PathBuf, File)> {
        let path = self.resolve(rel)?;
        if let Some(parent) = path.parent() {
            self.create_dirs(parent)?;
        }

        let existed = path.exists();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| DndError::host_io(&e, &path))?;
        if !existed {
            self.created.push(path.clone());
        }
        if mode & 0o777 != 0 {
            set_mode(&path, mode)?;
        }
        Ok((path, file))
    }

    fn create_dirs(&mut self, path: &Path) -> Result<()> {
        let mut missing = Vec::new();
        let mut cur = path;
        while cur != self.root.as_path() && !cur.exists() {
            missing.push(cur.to_path_buf());
            match cur.parent() {
                Some(parent) => cur = parent,
                None => break,
            }
        }
        for dir in missing.into_iter().rev() {
            fs::create_dir(&dir).map_err(|e| DndError::host_io(&e, &dir))?;
            self.created.push(dir);
        }
        Ok(())
    }

    /// Keep the staged files; dropping no longer rolls back
    pub fn commit(&mut self) {
        self.committed = true;
        tracing::debug!(root = %self.root.display(), entries = self.created.len(), "committed dropped files");
    }

    /// Remove everything created, then the root itself.
    ///
    /// Keeps going after individual failures and reports the first one.
    pub fn rollback(&mut self) -> Result<()> {
        if self.rolled_back {
            return Ok(());
        }
        self.rolled_back = true;

        let mut first_err = None;
        for path in self.created.drain(..).rev() {
            let res = if path.is_dir() {
                fs::remove_dir(&path)
            } else {
                fs::remove_file(&path)
            };
            if let Err(e) = res {
                if e.kind() != std::io::ErrorKind::NotFound && first_err.is_none() {
                    first_err = Some(DndError::host_io(&e, &path));
                }
            }
        }

        if let Err(e) = fs::remove_dir_all(&self.root) {
            if e.kind() != std::io::ErrorKind::NotFound && first_err.is_none() {
                first_err = Some(DndError::host_io(&e, &self.root));
            }
        }

        tracing::info!(root = %self.root.display(), "rolled back dropped files");
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for DroppedFiles {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = self.rollback() {
                tracing::warn!(error = %e, "rollback on drop failed");
            }
        }
    }
}

fn dir_mode(mode: u32) -> u32 {
    let mode = mode & 0o777;
    if mode == 0 {
        0o755
    } else {
        mode | 0o700
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o777))
        .map_err(|e| DndError::host_io(&e, path))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
