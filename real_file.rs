//! Real storage backend abstraction.
//!
//! Virtual files sit on top of a [`RealFile`], a handle to a file or
//! directory in some backing store. [`LocalFile`] implements it over the
//! local filesystem; other backends only need to provide the same
//! open/list/create/delete/rename operations.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, VaultError};

/// Byte stream opened on a real file.
pub trait RealStream: Read + Write + Seek + Send {
    fn set_length(&mut self, length: u64) -> Result<()>;
}

impl RealStream for File {
    fn set_length(&mut self, length: u64) -> Result<()> {
        self.set_len(length)?;
        Ok(())
    }
}

/// A file or directory in the backing store.
pub trait RealFile: Send + Sync + fmt::Debug {
    fn name(&self) -> String;

    /// Backend-specific display path.
    fn path(&self) -> String;

    fn exists(&self) -> bool;

    fn is_file(&self) -> bool;

    fn is_directory(&self) -> bool;

    fn length(&self) -> Result<u64>;

    fn parent(&self) -> Option<Box<dyn RealFile>>;

    /// Handle to a direct child, which need not exist yet.
    fn child(&self, name: &str) -> Box<dyn RealFile>;

    fn list_files(&self) -> Result<Vec<Box<dyn RealFile>>>;

    fn create_file(&self, name: &str) -> Result<Box<dyn RealFile>>;

    fn create_directory(&self, name: &str) -> Result<Box<dyn RealFile>>;

    /// Deletes the file, or the directory and everything below it.
    fn delete(&self) -> Result<()>;

    /// Renames within the same parent and returns the new handle.
    fn rename(&self, new_name: &str) -> Result<Box<dyn RealFile>>;

    fn open_read(&self) -> Result<Box<dyn RealStream>>;

    /// Opens for writing without truncating; creates the file if missing.
    fn open_write(&self) -> Result<Box<dyn RealStream>>;

    /// True if `other` is this location or lies below it.
    fn contains(&self, other: &dyn RealFile) -> bool;

    fn clone_box(&self) -> Box<dyn RealFile>;
}

impl Clone for Box<dyn RealFile> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// [`RealFile`] on the local filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    path: PathBuf,
}

impl LocalFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn as_path(&self) -> &Path {
        &self.path
    }

    fn check_name(name: &str) -> Result<()> {
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(VaultError::format(format!("invalid file name {name:?}")));
        }
        Ok(())
    }
}

impl RealFile for LocalFile {
    fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn path(&self) -> String {
        self.path.display().to_string()
    }

    fn exists(&self) -> bool {
        self.path.exists()
    }

    fn is_file(&self) -> bool {
        self.path.is_file()
    }

    fn is_directory(&self) -> bool {
        self.path.is_dir()
    }

    fn length(&self) -> Result<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }

    fn parent(&self) -> Option<Box<dyn RealFile>> {
        self.path
            .parent()
            .map(|p| Box::new(LocalFile::new(p)) as Box<dyn RealFile>)
    }

    fn child(&self, name: &str) -> Box<dyn RealFile> {
        Box::new(LocalFile::new(self.path.join(name)))
    }

    fn list_files(&self) -> Result<Vec<Box<dyn RealFile>>> {
        let mut entries: Vec<PathBuf> = fs::read_dir(&self.path)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<_>>()?;
        entries.sort();
        Ok(entries
            .into_iter()
            .map(|p| Box::new(LocalFile::new(p)) as Box<dyn RealFile>)
            .collect())
    }

    fn create_file(&self, name: &str) -> Result<Box<dyn RealFile>> {
        Self::check_name(name)?;
        let path = self.path.join(name);
        OpenOptions::new().write(true).create_new(true).open(&path)?;
        Ok(Box::new(LocalFile::new(path)))
    }

    fn create_directory(&self, name: &str) -> Result<Box<dyn RealFile>> {
        Self::check_name(name)?;
        let path = self.path.join(name);
        fs::create_dir(&path)?;
        Ok(Box::new(LocalFile::new(path)))
    }

    fn delete(&self) -> Result<()> {
        if self.path.is_dir() {
            fs::remove_dir_all(&self.path)?;
        } else {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn rename(&self, new_name: &str) -> Result<Box<dyn RealFile>> {
        Self::check_name(new_name)?;
        let target = self.path.with_file_name(new_name);
        if target.exists() {
            return Err(VaultError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} already exists", target.display()),
            )));
        }
        fs::rename(&self.path, &target)?;
        Ok(Box::new(LocalFile::new(target)))
    }

    fn open_read(&self) -> Result<Box<dyn RealStream>> {
        Ok(Box::new(File::open(&self.path)?))
    }

    fn open_write(&self) -> Result<Box<dyn RealStream>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        Ok(Box::new(file))
    }

    fn contains(&self, other: &dyn RealFile) -> bool {
        let (Ok(root), Ok(candidate)) = (
            fs::canonicalize(&self.path),
            canonical_or_parent(Path::new(&other.path())),
        ) else {
            return false;
        };
        candidate.starts_with(root)
    }

    fn clone_box(&self) -> Box<dyn RealFile> {
        Box::new(self.clone())
    }
}

/// Canonical form of `path`, resolving through the parent when the path
/// itself does not exist yet.
fn canonical_or_parent(path: &Path) -> std::io::Result<PathBuf> {
    match fs::canonicalize(path) {
        Ok(p) => Ok(p),
        Err(e) => match (path.parent(), path.file_name()) {
            (Some(parent), Some(name)) => Ok(fs::canonicalize(parent)?.join(name)),
            _ => Err(e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::SeekFrom;
    use tempfile::TempDir;

    #[test]
    fn create_list_rename_delete() {
        let tmp = TempDir::new().unwrap();
        let root = LocalFile::new(tmp.path());
        let dir = root.create_directory("docs").unwrap();
        let file = dir.create_file("a.txt").unwrap();
        assert!(file.is_file());
        assert!(dir.create_file("a.txt").is_err());

        let renamed = file.rename("b.txt").unwrap();
        assert_eq!(renamed.name(), "b.txt");
        assert!(!file.exists());
        let names: Vec<String> = dir.list_files().unwrap().iter().map(|f| f.name()).collect();
        assert_eq!(names, vec!["b.txt"]);

        dir.delete().unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn write_does_not_truncate() {
        let tmp = TempDir::new().unwrap();
        let file = LocalFile::new(tmp.path()).create_file("data").unwrap();
        file.open_write().unwrap().write_all(b"hello world").unwrap();
        let mut stream = file.open_write().unwrap();
        stream.seek(SeekFrom::Start(6)).unwrap();
        stream.write_all(b"there").unwrap();
        drop(stream);
        assert_eq!(fs::read(tmp.path().join("data")).unwrap(), b"hello there");
    }

    #[test]
    fn containment() {
        let tmp = TempDir::new().unwrap();
        let root = LocalFile::new(tmp.path());
        let inner = root.create_directory("inner").unwrap();
        assert!(root.contains(inner.as_ref()));
        assert!(root.contains(inner.child("not-yet").as_ref()));
        assert!(!inner.contains(&root));
    }

    #[test]
    fn rejects_path_like_names() {
        let tmp = TempDir::new().unwrap();
        let root = LocalFile::new(tmp.path());
        assert!(root.create_file("../escape").is_err());
        assert!(root.create_directory("..").is_err());
    }
}
