//! Encrypted files and directories inside a drive.
//!
//! A [`VirtualFile`] borrows its [`Drive`] and wraps one real file or
//! directory. Names are encrypted with [`crate::names`]; file contents use
//! the content format with a nonce taken from the drive's sequencer when
//! the file is first written.

use std::fmt;
use std::io::{self, Read, Write};
use tracing::debug;

use crate::drive::Drive;
use crate::error::{Result, VaultError};
use crate::header::{plaintext_length, EncryptionMode, Header, HEADER_LENGTH};
use crate::integrity::{validate_chunk_size, Integrity};
use crate::names::{decrypt_name, encrypt_name};
use crate::real_file::{RealFile, RealStream};
use crate::streaming::ContentStream;

pub type FileStream = ContentStream<Box<dyn RealStream>>;

pub struct VirtualFile<'d> {
    drive: &'d Drive,
    real: Box<dyn RealFile>,
    apply_integrity: bool,
    chunk_size: u32,
    verify_integrity: bool,
    allow_overwrite: bool,
}

impl<'d> VirtualFile<'d> {
    pub(crate) fn new(drive: &'d Drive, real: Box<dyn RealFile>) -> Self {
        let options = drive.options();
        Self {
            drive,
            real,
            apply_integrity: options.integrity,
            chunk_size: options.chunk_size,
            verify_integrity: options.integrity,
            allow_overwrite: false,
        }
    }

    pub fn drive(&self) -> &'d Drive {
        self.drive
    }

    pub fn real_file(&self) -> &dyn RealFile {
        self.real.as_ref()
    }

    pub fn is_root(&self) -> bool {
        self.real.path() == self.drive.virtual_root().path()
    }

    pub fn exists(&self) -> bool {
        self.real.exists()
    }

    pub fn is_file(&self) -> bool {
        self.real.is_file()
    }

    pub fn is_directory(&self) -> bool {
        self.real.is_directory()
    }

    /// Decrypted name; empty for the root.
    pub fn name(&self) -> Result<String> {
        if self.is_root() {
            return Ok(String::new());
        }
        decrypt_name(
            &self.real.name(),
            self.drive.keys().drive_key(),
            self.drive.options().provider,
        )
    }

    /// Absolute virtual path, `/` for the root.
    pub fn path(&self) -> Result<String> {
        let mut segments = Vec::new();
        let mut current = Some(self.clone_handle());
        while let Some(file) = current {
            if file.is_root() {
                break;
            }
            segments.push(file.name()?);
            current = file.parent();
        }
        segments.reverse();
        Ok(format!("/{}", segments.join("/")))
    }

    pub fn parent(&self) -> Option<VirtualFile<'d>> {
        if self.is_root() {
            return None;
        }
        let parent = self.real.parent()?;
        if !self.drive.virtual_root().contains(parent.as_ref()) {
            return None;
        }
        Some(VirtualFile::new(self.drive, parent))
    }

    /// Header of the stored content, `None` for empty or new files.
    pub fn header(&self) -> Result<Option<Header>> {
        if !self.is_file() {
            return Ok(None);
        }
        let mut stream = self.real.open_read()?;
        Header::read_from(&mut stream)
    }

    /// Plaintext length of the file.
    pub fn length(&self) -> Result<u64> {
        if !self.is_file() {
            return Ok(0);
        }
        match self.header()? {
            Some(header) => Ok(plaintext_length(
                self.real.length()?.saturating_sub(HEADER_LENGTH as u64),
                header.chunk_size(),
            )),
            None => Ok(0),
        }
    }

    pub fn list_files(&self) -> Result<Vec<VirtualFile<'d>>> {
        if !self.is_directory() {
            return Ok(Vec::new());
        }
        Ok(self
            .real
            .list_files()?
            .into_iter()
            .map(|real| VirtualFile::new(self.drive, real))
            .collect())
    }

    /// Child with the decrypted name `name`.
    pub fn child(&self, name: &str) -> Result<Option<VirtualFile<'d>>> {
        for file in self.list_files()? {
            match file.name() {
                Ok(n) if n == name => return Ok(Some(file)),
                Ok(_) => {}
                Err(e) => debug!(file = %file.real.name(), error = %e, "skipping undecryptable entry"),
            }
        }
        Ok(None)
    }

    pub fn create_file(&self, name: &str) -> Result<VirtualFile<'d>> {
        let real_name = self.new_real_name(name)?;
        let real = self.real.create_file(&real_name)?;
        Ok(VirtualFile::new(self.drive, real))
    }

    pub fn create_directory(&self, name: &str) -> Result<VirtualFile<'d>> {
        let real_name = self.new_real_name(name)?;
        let real = self.real.create_directory(&real_name)?;
        Ok(VirtualFile::new(self.drive, real))
    }

    fn new_real_name(&self, name: &str) -> Result<String> {
        if !self.is_directory() {
            return Err(VaultError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "parent is not a directory",
            )));
        }
        if name.is_empty() || name.contains('/') {
            return Err(VaultError::format(format!("invalid file name {name:?}")));
        }
        if self.child(name)?.is_some() {
            return Err(VaultError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{name} already exists"),
            )));
        }
        encrypt_name(
            name,
            self.drive.keys().drive_key(),
            self.drive.next_nonce()?,
            self.drive.options().provider,
        )
    }

    /// Deletes the file, or the directory with everything in it.
    pub fn delete(&self) -> Result<()> {
        if self.is_root() {
            return Err(VaultError::security("refusing to delete the drive root"));
        }
        self.real.delete()
    }

    /// Renames in place; the new name is encrypted under a fresh nonce.
    pub fn rename(&mut self, new_name: &str) -> Result<()> {
        let parent = self
            .parent()
            .ok_or_else(|| VaultError::security("cannot rename the drive root"))?;
        let real_name = parent.new_real_name(new_name)?;
        self.real = self.real.rename(&real_name)?;
        Ok(())
    }

    /// Tag new content; `chunk_size` overrides the drive default.
    pub fn set_apply_integrity(&mut self, apply: bool, chunk_size: Option<u32>) -> Result<()> {
        if let Some(chunk_size) = chunk_size {
            validate_chunk_size(chunk_size)?;
            self.chunk_size = chunk_size;
        }
        self.apply_integrity = apply;
        Ok(())
    }

    pub fn set_verify_integrity(&mut self, verify: bool) {
        self.verify_integrity = verify;
    }

    /// Allow writing into content that already has a header.
    ///
    /// The existing nonce is reused, so only regions that were never written
    /// (or identical plaintext) may be written this way.
    pub fn set_allow_overwrite(&mut self, allow: bool) {
        self.allow_overwrite = allow;
    }

    pub fn input_stream(&self) -> Result<FileStream> {
        let keys = self.drive.keys();
        ContentStream::decrypt(
            self.real.open_read()?,
            keys.drive_key(),
            Some(keys.hash_key().clone()),
            self.verify_integrity,
            self.drive.options().provider,
        )
    }

    /// Opens the file for writing.
    ///
    /// A file without content gets a new nonce and header. A file with
    /// content is only reopened when overwrite is allowed, keeping its header.
    pub fn output_stream(&self) -> Result<FileStream> {
        if !self.is_file() {
            return Err(VaultError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "not a file",
            )));
        }
        let keys = self.drive.keys();
        let provider = self.drive.options().provider;
        match self.header()? {
            Some(header) => {
                if !self.allow_overwrite {
                    return Err(VaultError::security(
                        "file already has content and overwrite is not allowed",
                    ));
                }
                let integrity = Integrity::for_writing(
                    header.chunk_size() > 0,
                    Some(keys.hash_key().clone()),
                    header.chunk_size(),
                )?;
                let mut stream = ContentStream::attach(
                    self.real.open_write()?,
                    EncryptionMode::Encrypt,
                    keys.drive_key(),
                    header,
                    integrity,
                    provider,
                )?;
                stream.set_allow_range_write(true);
                Ok(stream)
            }
            None => {
                let integrity = Integrity::for_writing(
                    self.apply_integrity,
                    Some(keys.hash_key().clone()),
                    self.chunk_size,
                )?;
                let nonce = self.drive.next_nonce()?;
                let mut base = self.real.open_write()?;
                base.set_length(0)?;
                let mut stream = ContentStream::encrypt(base, keys.drive_key(), nonce, integrity, provider)?;
                stream.set_allow_range_write(self.allow_overwrite);
                Ok(stream)
            }
        }
    }

    pub fn read_all(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.input_stream()?.read_to_end(&mut out)?;
        Ok(out)
    }

    pub fn write_all(&self, data: &[u8]) -> Result<()> {
        let mut stream = self.output_stream()?;
        stream.write_all(data)?;
        stream.finish()?;
        Ok(())
    }

    fn clone_handle(&self) -> VirtualFile<'d> {
        VirtualFile {
            drive: self.drive,
            real: self.real.clone(),
            apply_integrity: self.apply_integrity,
            chunk_size: self.chunk_size,
            verify_integrity: self.verify_integrity,
            allow_overwrite: self.allow_overwrite,
        }
    }
}

impl Clone for VirtualFile<'_> {
    fn clone(&self) -> Self {
        self.clone_handle()
    }
}

impl fmt::Debug for VirtualFile<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualFile")
            .field("real", &self.real.path())
            .field("apply_integrity", &self.apply_integrity)
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::DriveOptions;
    use crate::real_file::LocalFile;
    use crate::sequencer::{MemorySequencer, NonceSequencer};
    use std::io::{Seek, SeekFrom};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn drive(tmp: &TempDir) -> Drive {
        let sequencer: Arc<dyn NonceSequencer> = Arc::new(MemorySequencer::new());
        let options = DriveOptions {
            iterations: 8,
            chunk_size: 128,
            ..DriveOptions::default()
        };
        Drive::create(Box::new(LocalFile::new(tmp.path())), "pw", sequencer, options).unwrap()
    }

    #[test]
    fn tree_with_encrypted_names() {
        let tmp = TempDir::new().unwrap();
        let drive = drive(&tmp);
        let root = drive.root();
        let docs = root.create_directory("docs").unwrap();
        let file = docs.create_file("notes.txt").unwrap();
        file.write_all(b"hello vault").unwrap();

        assert_eq!(file.path().unwrap(), "/docs/notes.txt");
        assert_eq!(file.length().unwrap(), 11);
        assert_eq!(file.read_all().unwrap(), b"hello vault");
        assert!(!file.real_file().name().contains("notes"));

        let found = drive.resolve("/docs/notes.txt").unwrap().unwrap();
        assert_eq!(found.read_all().unwrap(), b"hello vault");
        assert!(drive.resolve("/docs/missing").unwrap().is_none());
        assert!(docs.create_file("notes.txt").is_err());
    }

    #[test]
    fn rename_and_delete() {
        let tmp = TempDir::new().unwrap();
        let drive = drive(&tmp);
        let mut file = drive.root().create_file("a").unwrap();
        file.write_all(b"x").unwrap();
        file.rename("b").unwrap();
        assert_eq!(file.name().unwrap(), "b");
        assert!(drive.resolve("a").unwrap().is_none());
        file.delete().unwrap();
        assert!(drive.resolve("b").unwrap().is_none());
        assert!(drive.root().delete().is_err());
    }

    #[test]
    fn rewrite_needs_overwrite() {
        let tmp = TempDir::new().unwrap();
        let drive = drive(&tmp);
        let mut file = drive.root().create_file("f").unwrap();
        file.write_all(&[1u8; 300]).unwrap();
        assert!(file.output_stream().is_err());

        file.set_allow_overwrite(true);
        let mut stream = file.output_stream().unwrap();
        stream.seek(SeekFrom::Start(128)).unwrap();
        stream.write_all(&[1u8; 128]).unwrap();
        stream.finish().unwrap();
        assert_eq!(file.read_all().unwrap(), vec![1u8; 300]);
    }

    #[test]
    fn untagged_files_need_verify_off() {
        let tmp = TempDir::new().unwrap();
        let drive = drive(&tmp);
        let mut file = drive.root().create_file("plain").unwrap();
        file.set_apply_integrity(false, None).unwrap();
        file.write_all(b"untagged").unwrap();
        assert_eq!(file.header().unwrap().unwrap().chunk_size(), 0);
        assert!(file.read_all().is_err());
        file.set_verify_integrity(false);
        assert_eq!(file.read_all().unwrap(), b"untagged");
    }

    #[test]
    fn every_write_uses_a_new_nonce() {
        let tmp = TempDir::new().unwrap();
        let drive = drive(&tmp);
        let a = drive.root().create_file("a").unwrap();
        let b = drive.root().create_file("b").unwrap();
        a.write_all(b"same").unwrap();
        b.write_all(b"same").unwrap();
        let na = a.header().unwrap().unwrap().nonce();
        let nb = b.header().unwrap().unwrap().nonce();
        assert_ne!(na, nb);
    }
}
