//! Seekable encrypted content streams.
//!
//! This module provides [`ContentStream`], which wraps any `Read`/`Write` +
//! `Seek` backend and exposes the plaintext view of the content format
//! defined in [`crate::header`].
//!
//! ## Random Access
//!
//! The logical position `p` maps to the physical offset
//! `header + p + tags_before(p)`. Reads fetch whole chunks (or 16-byte blocks
//! when there are no tags) and verify them before any byte is returned.
//! Writes are staged until a whole chunk is available; the final partial
//! chunk is written by [`ContentStream::finish`] or `flush`.
//!
//! An encrypt stream only writes at position 0 unless range writes are
//! allowed, since rewriting other positions reuses the file's nonce.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use zeroize::Zeroizing;

use crate::cipher::{counter_for, create_transformer, CtrTransformer, ProviderType, BLOCK_SIZE};
use crate::error::{Result, VaultError};
use crate::header::{chunk_groups, physical_length, plaintext_length, EncryptionMode, Header, HEADER_LENGTH};
use crate::integrity::{Integrity, HASH_RESULT_LENGTH};
use crate::key_manager::SecretKey;
use crate::nonce::Nonce;

/// Default amount of plaintext processed per backend access
pub const DEFAULT_BUFFER_SIZE: usize = 512 * 1024;

pub struct ContentStream<S> {
    base: S,
    mode: EncryptionMode,
    header: Option<Header>,
    iv: Vec<u8>,
    transformer: Box<dyn CtrTransformer>,
    integrity: Integrity,
    position: u64,
    pending: Zeroizing<Vec<u8>>,
    allow_range_write: bool,
    fail_silently: bool,
    buffer_size: usize,
}

impl<S: Seek> ContentStream<S> {
    /// Wraps `base` as headered content whose header is already known.
    ///
    /// Nothing is written; this is how parallel workers open their own view
    /// of a file another stream created.
    pub fn attach(
        base: S,
        mode: EncryptionMode,
        key: &SecretKey,
        header: Header,
        integrity: Integrity,
        provider: ProviderType,
    ) -> Result<Self> {
        if header.chunk_size() != integrity.chunk_size() {
            return Err(VaultError::security(format!(
                "header chunk size {} does not match integrity chunk size {}",
                header.chunk_size(),
                integrity.chunk_size()
            )));
        }
        if mode == EncryptionMode::Encrypt && integrity.chunk_size() > 0 && !integrity.apply() {
            return Err(VaultError::security(
                "tagged content can only be written with integrity applied",
            ));
        }
        let iv = header.nonce().as_bytes().to_vec();
        Ok(Self::build(base, mode, key, Some(header), iv, integrity, provider))
    }

    /// Wraps `base` as headerless CTR ciphertext under an explicit IV.
    pub fn attach_raw(
        base: S,
        mode: EncryptionMode,
        key: &SecretKey,
        iv: &[u8],
        provider: ProviderType,
    ) -> Result<Self> {
        counter_for(iv, 0)?;
        Ok(Self::build(
            base,
            mode,
            key,
            None,
            iv.to_vec(),
            Integrity::disabled(),
            provider,
        ))
    }

    fn build(
        base: S,
        mode: EncryptionMode,
        key: &SecretKey,
        header: Option<Header>,
        iv: Vec<u8>,
        integrity: Integrity,
        provider: ProviderType,
    ) -> Self {
        Self {
            base,
            mode,
            header,
            iv,
            transformer: create_transformer(provider, key.as_bytes()),
            integrity,
            position: 0,
            pending: Zeroizing::new(Vec::new()),
            allow_range_write: false,
            fail_silently: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    pub fn mode(&self) -> EncryptionMode {
        self.mode
    }

    pub fn header(&self) -> Option<&Header> {
        self.header.as_ref()
    }

    pub fn integrity(&self) -> &Integrity {
        &self.integrity
    }

    pub fn set_allow_range_write(&mut self, allow: bool) {
        self.allow_range_write = allow;
    }

    /// End the stream quietly (reads return 0) on an integrity failure
    /// instead of returning the error.
    pub fn set_fail_silently(&mut self, fail_silently: bool) {
        self.fail_silently = fail_silently;
    }

    pub fn set_buffer_size(&mut self, size: usize) {
        self.buffer_size = size.max(1);
    }

    /// Logical position, including bytes staged but not yet written.
    pub fn position(&self) -> u64 {
        self.position + self.pending.len() as u64
    }

    /// Plaintext length of the content.
    pub fn length(&mut self) -> Result<u64> {
        let physical = base_length(&mut self.base)?;
        let header = self.header_length();
        let on_disk = plaintext_length(physical.saturating_sub(header), self.integrity.chunk_size());
        Ok(on_disk.max(self.position()))
    }

    /// Moves to logical position `pos`.
    pub fn seek_to(&mut self, pos: u64) -> Result<()> {
        if pos == self.position() {
            return Ok(());
        }
        if self.mode == EncryptionMode::Encrypt {
            if !self.pending.is_empty() {
                return Err(VaultError::security(
                    "flush staged data before seeking an encrypt stream",
                ));
            }
            if pos != 0 && !self.allow_range_write {
                return Err(VaultError::security(
                    "range writes are not allowed on this stream",
                ));
            }
        }
        self.position = pos;
        Ok(())
    }

    fn header_length(&self) -> u64 {
        if self.header.is_some() {
            HEADER_LENGTH as u64
        } else {
            0
        }
    }

    fn align_size(&self) -> u64 {
        match self.integrity.chunk_size() {
            0 => BLOCK_SIZE as u64,
            chunk => u64::from(chunk),
        }
    }

    /// Units of `align_size` processed per backend access.
    fn batch_size(&self) -> u64 {
        let align = self.align_size();
        (self.buffer_size as u64 / align).max(1) * align
    }

    fn physical_position(&self, logical: u64) -> u64 {
        let chunk = u64::from(self.integrity.chunk_size());
        let tags = if chunk == 0 {
            0
        } else {
            logical.div_ceil(chunk) * HASH_RESULT_LENGTH as u64
        };
        self.header_length() + logical + tags
    }

    fn header_bytes(&self) -> Option<[u8; HEADER_LENGTH]> {
        self.header.map(|h| h.to_bytes())
    }
}

impl<S: Read + Seek> ContentStream<S> {
    /// Opens existing headered content for reading.
    pub fn decrypt(
        mut base: S,
        key: &SecretKey,
        hash_key: Option<SecretKey>,
        verify: bool,
        provider: ProviderType,
    ) -> Result<Self> {
        base.seek(SeekFrom::Start(0))?;
        let header = Header::read_from(&mut base)?
            .ok_or_else(|| VaultError::format("content is empty, no header found"))?;
        let integrity = Integrity::for_content(verify, hash_key, header.chunk_size())?;
        Self::attach(base, EncryptionMode::Decrypt, key, header, integrity, provider)
    }

    /// Reads plaintext at the current position.
    pub fn read_plain(&mut self, out: &mut [u8]) -> Result<usize> {
        if self.mode != EncryptionMode::Decrypt {
            return Err(VaultError::security("stream was opened for writing"));
        }
        if out.is_empty() {
            return Ok(0);
        }
        let length = self.length()?;
        if self.position >= length {
            return Ok(0);
        }

        let align = self.align_size();
        let start = self.position - self.position % align;
        let skip = (self.position - start) as usize;
        let wanted = (out.len() as u64).min(length - self.position);
        let end = (self.position + wanted)
            .div_ceil(align)
            .saturating_mul(align)
            .min(length)
            .min(start + self.batch_size());

        let plain = match self.decrypt_range(start, end - start) {
            Ok(plain) => plain,
            Err(err) if err.is_integrity() && self.fail_silently => return Ok(0),
            Err(err) => return Err(err),
        };
        let n = plain.len().saturating_sub(skip).min(wanted as usize);
        out[..n].copy_from_slice(&plain[skip..skip + n]);
        self.position += n as u64;
        Ok(n)
    }

    /// Decrypts `len` logical bytes starting at the aligned position `start`.
    ///
    /// Chunks are verified in order. A failing first chunk is an error; a
    /// later failure truncates the result so the next read reports it.
    fn decrypt_range(&mut self, start: u64, len: u64) -> Result<Zeroizing<Vec<u8>>> {
        let chunk = self.integrity.chunk_size();
        let physical_len = if chunk == 0 {
            len
        } else {
            physical_length(len, chunk)
        };
        let mut raw = vec![0u8; physical_len as usize];
        self.base.seek(SeekFrom::Start(self.physical_position(start)))?;
        self.base.read_exact(&mut raw)?;

        let mut plain = Zeroizing::new(Vec::with_capacity(len as usize));
        if chunk == 0 {
            plain.resize(raw.len(), 0);
            let counter = counter_for(&self.iv, start / BLOCK_SIZE as u64)?;
            self.transformer.transform(&counter, &raw, &mut plain)?;
            return Ok(plain);
        }

        let header_bytes = self.header_bytes();
        let mut offset = start;
        for (i, (tag, data)) in chunk_groups(&raw, chunk).enumerate() {
            if self.integrity.apply() {
                let header = if offset == 0 {
                    header_bytes.as_ref().map(|h| &h[..])
                } else {
                    None
                };
                if self.integrity.verify_chunk(tag, data, header).is_err() {
                    if i == 0 {
                        return Err(VaultError::integrity(format!(
                            "chunk {} failed verification",
                            offset / u64::from(chunk)
                        )));
                    }
                    break;
                }
            }
            let counter = counter_for(&self.iv, offset / BLOCK_SIZE as u64)?;
            let from = plain.len();
            plain.resize(from + data.len(), 0);
            self.transformer.transform(&counter, data, &mut plain[from..])?;
            offset += data.len() as u64;
        }
        Ok(plain)
    }
}

impl<S: Write + Seek> ContentStream<S> {
    /// Starts new headered content at the beginning of `base`.
    pub fn encrypt(
        mut base: S,
        key: &SecretKey,
        nonce: Nonce,
        integrity: Integrity,
        provider: ProviderType,
    ) -> Result<Self> {
        let header = Header::new(nonce, integrity.chunk_size())?;
        base.seek(SeekFrom::Start(0))?;
        base.write_all(&header.to_bytes())?;
        Self::attach(base, EncryptionMode::Encrypt, key, header, integrity, provider)
    }

    /// Stages plaintext, writing every complete batch of chunks.
    pub fn write_plain(&mut self, data: &[u8]) -> Result<usize> {
        if self.mode != EncryptionMode::Encrypt {
            return Err(VaultError::security("stream was opened for reading"));
        }
        if self.position % self.align_size() != 0 {
            return Err(VaultError::security(
                "cannot write past a partial chunk, writes must start chunk aligned",
            ));
        }
        self.pending.extend_from_slice(data);
        let batch = self.batch_size() as usize;
        while self.pending.len() >= batch {
            self.emit(batch)?;
        }
        Ok(data.len())
    }

    /// Writes any staged plaintext, including a final partial chunk.
    pub fn flush_pending(&mut self) -> Result<()> {
        if !self.pending.is_empty() {
            self.emit(self.pending.len())?;
        }
        self.base.flush()?;
        Ok(())
    }

    /// Flushes and hands back the backend.
    pub fn finish(mut self) -> Result<S> {
        self.flush_pending()?;
        Ok(self.base)
    }

    fn emit(&mut self, count: usize) -> Result<()> {
        let start = self.position;
        let chunk = self.integrity.chunk_size();
        let counter = counter_for(&self.iv, start / BLOCK_SIZE as u64)?;
        let mut cipher = vec![0u8; count];
        self.transformer
            .transform(&counter, &self.pending[..count], &mut cipher)?;

        let out = if chunk == 0 {
            cipher
        } else {
            let header_bytes = self.header_bytes();
            let mut out = Vec::with_capacity(physical_length(count as u64, chunk) as usize);
            for (i, piece) in cipher.chunks(chunk as usize).enumerate() {
                let header = if start == 0 && i == 0 {
                    header_bytes.as_ref().map(|h| &h[..])
                } else {
                    None
                };
                out.extend_from_slice(&self.integrity.calculate_hash(piece, header)?);
                out.extend_from_slice(piece);
            }
            out
        };

        self.base.seek(SeekFrom::Start(self.physical_position(start)))?;
        self.base.write_all(&out)?;
        self.pending.drain(..count);
        self.position += count as u64;
        Ok(())
    }
}

fn base_length<S: Seek>(base: &mut S) -> io::Result<u64> {
    let current = base.stream_position()?;
    let end = base.seek(SeekFrom::End(0))?;
    if current != end {
        base.seek(SeekFrom::Start(current))?;
    }
    Ok(end)
}

impl<S: Read + Seek> Read for ContentStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_plain(buf).map_err(io::Error::from)
    }
}

impl<S: Write + Seek> Write for ContentStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_plain(buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_pending().map_err(io::Error::from)
    }
}

impl<S: Seek> Seek for ContentStream<S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(delta) => self.position().checked_add_signed(delta),
            SeekFrom::End(delta) => self.length()?.checked_add_signed(delta),
        }
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek before start"))?;
        self.seek_to(target)?;
        Ok(target)
    }
}

impl<S> fmt::Debug for ContentStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentStream")
            .field("mode", &self.mode)
            .field("header", &self.header)
            .field("integrity", &self.integrity)
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}
