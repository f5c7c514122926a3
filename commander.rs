//! Batch import and export.
//!
//! [`FileImporter`] and [`FileExporter`] move one file between the host and
//! a drive with several workers, each streaming its own part of the file.
//! [`FileCommander`] runs whole batches on a blocking task, isolating
//! failures per file, reporting [`ProgressEvent`]s over a channel and
//! stopping between files when its [`CancellationToken`] fires.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::cipher::BLOCK_SIZE;
use crate::drive::Drive;
use crate::error::{Result, VaultError};
use crate::parallel::{split_ranges, WorkerPool};
use crate::real_file::{LocalFile, RealFile};
use crate::streaming::DEFAULT_BUFFER_SIZE;
use crate::virtual_file::VirtualFile;

/// Progress of a batch, one event per state change of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Started { name: String, bytes: u64 },
    Finished { name: String, bytes: u64 },
    Failed { name: String, error: String },
    Cancelled,
}

/// Outcome of a batch: every item either succeeded or failed with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResult<T> {
    pub succeeded: Vec<T>,
    pub failed: Vec<(T, String)>,
    pub cancelled: bool,
}

impl<T> Default for BatchResult<T> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
            cancelled: false,
        }
    }
}

fn not_found(what: impl std::fmt::Display) -> VaultError {
    VaultError::Io(io::Error::new(
        io::ErrorKind::NotFound,
        format!("{what} not found"),
    ))
}

/// Copies exactly `len` bytes through a zeroed-on-drop buffer.
fn copy_exact<R: Read, W: Write>(reader: &mut R, writer: &mut W, len: u64) -> Result<()> {
    let mut buf = Zeroizing::new(vec![0u8; DEFAULT_BUFFER_SIZE.min(len.max(1) as usize)]);
    let mut left = len;
    while left > 0 {
        let want = buf.len().min(left as usize);
        let n = reader.read(&mut buf[..want])?;
        if n == 0 {
            return Err(VaultError::format("source ended before its expected length"));
        }
        writer.write_all(&buf[..n])?;
        left -= n as u64;
    }
    Ok(())
}

/// Imports a host file into a drive directory.
#[derive(Debug)]
pub struct FileImporter {
    pool: WorkerPool,
}

impl FileImporter {
    pub fn new(threads: usize) -> Result<Self> {
        Ok(Self {
            pool: WorkerPool::new(threads)?,
        })
    }

    /// Encrypts `source` into a new file `name` under `dir`. The partially
    /// written file is removed if any part fails.
    pub fn import_file<'d>(
        &self,
        source: &dyn RealFile,
        dir: &VirtualFile<'d>,
        name: &str,
    ) -> Result<VirtualFile<'d>> {
        if !source.is_file() {
            return Err(not_found(source.path()));
        }
        let target = dir.create_file(name)?;
        match self.write_parts(source, &target) {
            Ok(()) => Ok(target),
            Err(err) => {
                if let Err(cleanup) = target.delete() {
                    warn!(error = %cleanup, "could not remove partially imported file");
                }
                Err(err)
            }
        }
    }

    fn write_parts(&self, source: &dyn RealFile, target: &VirtualFile<'_>) -> Result<()> {
        let length = source.length()?;
        // Writes the header and picks the nonce; workers attach to it.
        let mut first = target.output_stream()?;
        if self.pool.threads() == 1 {
            copy_exact(&mut source.open_read()?, &mut first, length)?;
            first.finish()?;
            return Ok(());
        }
        let align = match first.integrity().chunk_size() {
            0 => BLOCK_SIZE as u64,
            chunk => u64::from(chunk),
        };
        first.finish()?;

        let mut writer = target.clone();
        writer.set_allow_overwrite(true);
        let parts = split_ranges(length, self.pool.threads(), align);
        debug!(parts = parts.len(), bytes = length, "importing in parallel");
        self.pool.run(parts, |(start, len)| {
            let mut input = source.open_read()?;
            input.seek(SeekFrom::Start(start))?;
            let mut output = writer.output_stream()?;
            output.seek_to(start)?;
            copy_exact(&mut input, &mut output, len)?;
            output.finish()?;
            Ok(())
        })?;
        Ok(())
    }
}

/// Exports a drive file into a host directory.
#[derive(Debug)]
pub struct FileExporter {
    pool: WorkerPool,
}

impl FileExporter {
    pub fn new(threads: usize) -> Result<Self> {
        Ok(Self {
            pool: WorkerPool::new(threads)?,
        })
    }

    /// Decrypts `source` into a new file under `dir`, named after its
    /// decrypted name. The target is removed if any part fails.
    pub fn export_file(
        &self,
        source: &VirtualFile<'_>,
        dir: &dyn RealFile,
    ) -> Result<Box<dyn RealFile>> {
        if !source.is_file() {
            return Err(not_found("source file"));
        }
        let name = source.name()?;
        if dir.child(&name).exists() {
            return Err(VaultError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{name} already exists"),
            )));
        }
        let target = dir.create_file(&name)?;
        match self.read_parts(source, target.as_ref()) {
            Ok(()) => Ok(target),
            Err(err) => {
                if let Err(cleanup) = target.delete() {
                    warn!(error = %cleanup, "could not remove partially exported file");
                }
                Err(err)
            }
        }
    }

    fn read_parts(&self, source: &VirtualFile<'_>, target: &dyn RealFile) -> Result<()> {
        let length = source.length()?;
        target.open_write()?.set_length(length)?;
        let align = match source.header()?.map(|h| h.chunk_size()) {
            Some(chunk) if chunk > 0 => u64::from(chunk),
            _ => BLOCK_SIZE as u64,
        };
        let parts = split_ranges(length, self.pool.threads(), align);
        debug!(parts = parts.len(), bytes = length, "exporting in parallel");
        self.pool.run(parts, |(start, len)| {
            let mut input = source.input_stream()?;
            input.seek_to(start)?;
            let mut output = target.open_write()?;
            output.seek(SeekFrom::Start(start))?;
            copy_exact(&mut input, &mut output, len)?;
            output.flush()?;
            Ok(())
        })?;
        Ok(())
    }
}

/// Runs import and export batches against a shared drive.
#[derive(Debug, Clone)]
pub struct FileCommander {
    drive: Arc<Drive>,
    threads: usize,
}

impl FileCommander {
    pub fn new(drive: Arc<Drive>, threads: usize) -> Self {
        Self {
            drive,
            threads: threads.max(1),
        }
    }

    pub fn drive(&self) -> &Arc<Drive> {
        &self.drive
    }

    /// Imports host files and directories into the virtual directory
    /// `target_dir`. Directories are imported recursively.
    pub async fn import_files(
        &self,
        sources: Vec<PathBuf>,
        target_dir: String,
        events: UnboundedSender<ProgressEvent>,
        cancel: CancellationToken,
    ) -> Result<BatchResult<PathBuf>> {
        let drive = self.drive.clone();
        let threads = self.threads;
        tokio::task::spawn_blocking(move || {
            let importer = FileImporter::new(threads)?;
            let dir = drive
                .resolve(&target_dir)?
                .filter(|d| d.is_directory())
                .ok_or_else(|| not_found(format!("directory {target_dir}")))?;
            let mut batch = Batch::new(events, cancel);
            for source in &sources {
                if !batch.import_entry(&importer, source, &dir) {
                    break;
                }
            }
            info!(
                succeeded = batch.imported.succeeded.len(),
                failed = batch.imported.failed.len(),
                "import finished"
            );
            Ok(batch.imported)
        })
        .await
        .map_err(|e| VaultError::Io(io::Error::other(e)))?
    }

    /// Exports virtual files and directories (by virtual path) into the host
    /// directory `target_dir`.
    pub async fn export_files(
        &self,
        sources: Vec<String>,
        target_dir: PathBuf,
        events: UnboundedSender<ProgressEvent>,
        cancel: CancellationToken,
    ) -> Result<BatchResult<String>> {
        let drive = self.drive.clone();
        let threads = self.threads;
        tokio::task::spawn_blocking(move || {
            let exporter = FileExporter::new(threads)?;
            let dir = LocalFile::new(&target_dir);
            if !dir.is_directory() {
                return Err(not_found(format!("directory {}", target_dir.display())));
            }
            let mut batch = Batch::new(events, cancel);
            for path in &sources {
                let entry = match drive.resolve(path) {
                    Ok(Some(file)) => file,
                    Ok(None) => {
                        batch.fail_export(path.clone(), &not_found(path));
                        continue;
                    }
                    Err(err) => {
                        batch.fail_export(path.clone(), &err);
                        continue;
                    }
                };
                if !batch.export_entry(&exporter, &entry, path.clone(), &dir) {
                    break;
                }
            }
            info!(
                succeeded = batch.exported.succeeded.len(),
                failed = batch.exported.failed.len(),
                "export finished"
            );
            Ok(batch.exported)
        })
        .await
        .map_err(|e| VaultError::Io(io::Error::other(e)))?
    }
}

/// State of one running batch.
struct Batch {
    events: UnboundedSender<ProgressEvent>,
    cancel: CancellationToken,
    imported: BatchResult<PathBuf>,
    exported: BatchResult<String>,
}

impl Batch {
    fn new(events: UnboundedSender<ProgressEvent>, cancel: CancellationToken) -> Self {
        Self {
            events,
            cancel,
            imported: BatchResult::default(),
            exported: BatchResult::default(),
        }
    }

    fn send(&self, event: ProgressEvent) {
        // a dropped receiver only means nobody is watching
        let _ = self.events.send(event);
    }

    /// Returns false once the batch has been cancelled.
    fn check_cancel(&mut self) -> bool {
        if !self.cancel.is_cancelled() {
            return true;
        }
        if !self.imported.cancelled && !self.exported.cancelled {
            info!("batch cancelled");
            self.send(ProgressEvent::Cancelled);
        }
        self.imported.cancelled = true;
        self.exported.cancelled = true;
        false
    }

    fn fail_import(&mut self, path: PathBuf, err: &VaultError) {
        warn!(path = %path.display(), error = %err, "import failed");
        self.send(ProgressEvent::Failed {
            name: path.display().to_string(),
            error: err.to_string(),
        });
        self.imported.failed.push((path, err.to_string()));
    }

    fn fail_export(&mut self, path: String, err: &VaultError) {
        warn!(path = %path, error = %err, "export failed");
        self.send(ProgressEvent::Failed {
            name: path.clone(),
            error: err.to_string(),
        });
        self.exported.failed.push((path, err.to_string()));
    }

    fn import_entry(&mut self, importer: &FileImporter, source: &Path, dir: &VirtualFile<'_>) -> bool {
        if !self.check_cancel() {
            return false;
        }
        let real = LocalFile::new(source);
        let name = real.name();
        if real.is_directory() {
            let sub = match dir.child(&name) {
                Ok(Some(existing)) if existing.is_directory() => Ok(existing),
                Ok(_) => dir.create_directory(&name),
                Err(err) => Err(err),
            };
            let sub = match sub {
                Ok(sub) => sub,
                Err(err) => {
                    self.fail_import(source.to_path_buf(), &err);
                    return true;
                }
            };
            let children = match real.list_files() {
                Ok(children) => children,
                Err(err) => {
                    self.fail_import(source.to_path_buf(), &err);
                    return true;
                }
            };
            for child in children {
                if !self.import_entry(importer, Path::new(&child.path()), &sub) {
                    return false;
                }
            }
            return true;
        }

        let bytes = real.length().unwrap_or(0);
        self.send(ProgressEvent::Started {
            name: name.clone(),
            bytes,
        });
        match importer.import_file(&real, dir, &name) {
            Ok(_) => {
                debug!(path = %source.display(), bytes, "imported");
                self.send(ProgressEvent::Finished { name, bytes });
                self.imported.succeeded.push(source.to_path_buf());
            }
            Err(err) => self.fail_import(source.to_path_buf(), &err),
        }
        true
    }

    fn export_entry(
        &mut self,
        exporter: &FileExporter,
        entry: &VirtualFile<'_>,
        path: String,
        dir: &dyn RealFile,
    ) -> bool {
        if !self.check_cancel() {
            return false;
        }
        let name = match entry.name() {
            Ok(name) => name,
            Err(err) => {
                self.fail_export(path, &err);
                return true;
            }
        };
        if entry.is_directory() {
            let sub = if entry.is_root() {
                Ok(dir.clone_box())
            } else {
                let existing = dir.child(&name);
                if existing.is_directory() {
                    Ok(existing)
                } else {
                    dir.create_directory(&name)
                }
            };
            let (sub, children) = match sub.and_then(|sub| Ok((sub, entry.list_files()?))) {
                Ok(found) => found,
                Err(err) => {
                    self.fail_export(path, &err);
                    return true;
                }
            };
            for child in children {
                let child_path = match child.name() {
                    Ok(child_name) => format!("{}/{}", path.trim_end_matches('/'), child_name),
                    Err(err) => {
                        self.fail_export(format!("{path}/?"), &err);
                        continue;
                    }
                };
                if !self.export_entry(exporter, &child, child_path, sub.as_ref()) {
                    return false;
                }
            }
            return true;
        }

        let bytes = entry.length().unwrap_or(0);
        self.send(ProgressEvent::Started {
            name: name.clone(),
            bytes,
        });
        match exporter.export_file(entry, dir) {
            Ok(_) => {
                debug!(path = %path, bytes, "exported");
                self.send(ProgressEvent::Finished { name, bytes });
                self.exported.succeeded.push(path);
            }
            Err(err) => self.fail_export(path, &err),
        }
        true
    }
}
