//! Content format: header codec and layout math.
//!
//! ## Wire Format
//!
//! ```text
//! [magic:3 "SLM"][version:1][chunk_size:4 BE][nonce:8]
//! [tag:32][chunk:chunk_size][tag:32][chunk:chunk_size]...[tag:32][last chunk]
//! ```
//!
//! Tags are present only when `chunk_size > 0`. Every chunk is
//! `chunk_size` bytes except the last, which still carries its own tag.
//! Without a header (raw content) the stream is plain CTR ciphertext.

use std::io::{self, Read};

use crate::error::{Result, VaultError};
use crate::integrity::{validate_chunk_size, Hash, HASH_RESULT_LENGTH};
use crate::nonce::{Nonce, NONCE_LENGTH};

/// Format magic bytes
pub const MAGIC: [u8; 3] = *b"SLM";

/// Current format version
pub const VERSION: u8 = 2;

/// Total header length
pub const HEADER_LENGTH: usize = MAGIC.len() + 1 + 4 + NONCE_LENGTH;

/// Direction a stream or layout computation works in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMode {
    Encrypt,
    Decrypt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    nonce: Nonce,
    chunk_size: u32,
}

impl Header {
    pub fn new(nonce: Nonce, chunk_size: u32) -> Result<Self> {
        validate_chunk_size(chunk_size)?;
        Ok(Self { nonce, chunk_size })
    }

    pub fn nonce(&self) -> Nonce {
        self.nonce
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LENGTH] {
        let mut out = [0u8; HEADER_LENGTH];
        out[..3].copy_from_slice(&MAGIC);
        out[3] = VERSION;
        out[4..8].copy_from_slice(&self.chunk_size.to_be_bytes());
        out[8..].copy_from_slice(self.nonce.as_bytes());
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LENGTH {
            return Err(VaultError::format(format!(
                "header needs {HEADER_LENGTH} bytes, got {}",
                bytes.len()
            )));
        }
        if bytes[..3] != MAGIC {
            return Err(VaultError::format("not an encrypted content stream"));
        }
        if bytes[3] != VERSION {
            return Err(VaultError::format(format!(
                "unsupported format version {}",
                bytes[3]
            )));
        }
        let chunk_size = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let nonce = Nonce::from_slice(&bytes[8..HEADER_LENGTH])?;
        Self::new(nonce, chunk_size).map_err(|e| VaultError::format(e.to_string()))
    }

    /// Reads a header from the start of `reader`; `None` for an empty stream.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Option<Self>> {
        let mut buf = [0u8; HEADER_LENGTH];
        let mut filled = 0;
        while filled < HEADER_LENGTH {
            match reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        match filled {
            0 => Ok(None),
            n if n < HEADER_LENGTH => Err(VaultError::format("truncated header")),
            _ => Self::parse(&buf).map(Some),
        }
    }
}

/// Total bytes of tags carried by `length` bytes of content.
///
/// In `Decrypt` mode `length` is physical (tags included) and every
/// `chunk_size + hash_offset` bytes hold one tag; a trailing partial group
/// counts only if it extends past `hash_offset`. In `Encrypt` mode `length`
/// is plaintext and every `chunk_size` bytes get a tag.
pub fn total_hash_data_length(
    mode: EncryptionMode,
    length: u64,
    chunk_size: u32,
    hash_offset: u64,
    hash_length: u64,
) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    let chunk_size = u64::from(chunk_size);
    let chunks = match mode {
        EncryptionMode::Decrypt => {
            let group = chunk_size + hash_offset;
            length / group + u64::from(length % group > hash_offset)
        }
        EncryptionMode::Encrypt => length / chunk_size + u64::from(length % chunk_size > hash_offset),
    };
    chunks * hash_length
}

/// Plaintext length of `physical` bytes of post-header content.
pub fn plaintext_length(physical: u64, chunk_size: u32) -> u64 {
    if chunk_size == 0 {
        return physical;
    }
    let group = u64::from(chunk_size) + HASH_RESULT_LENGTH as u64;
    let rem = physical % group;
    (physical / group) * u64::from(chunk_size) + rem.saturating_sub(HASH_RESULT_LENGTH as u64)
}

/// Physical length of `plaintext` bytes of content, header excluded.
pub fn physical_length(plaintext: u64, chunk_size: u32) -> u64 {
    plaintext
        + total_hash_data_length(
            EncryptionMode::Encrypt,
            plaintext,
            chunk_size,
            0,
            HASH_RESULT_LENGTH as u64,
        )
}

/// Size of the output produced by transforming `length` bytes in `mode`.
pub fn output_size(mode: EncryptionMode, length: u64, chunk_size: u32, with_header: bool) -> u64 {
    let header = if with_header { HEADER_LENGTH as u64 } else { 0 };
    match mode {
        EncryptionMode::Encrypt => header + physical_length(length, chunk_size),
        EncryptionMode::Decrypt => plaintext_length(length.saturating_sub(header), chunk_size),
    }
}

/// Splits post-header content into `(tag, chunk)` pairs.
pub fn chunk_groups(buffer: &[u8], chunk_size: u32) -> impl Iterator<Item = (&[u8], &[u8])> {
    let group = chunk_size as usize + HASH_RESULT_LENGTH;
    buffer
        .chunks(group)
        .map(|g| g.split_at(HASH_RESULT_LENGTH.min(g.len())))
}

/// Extracts the tags from post-header content.
pub fn get_hashes(buffer: &[u8], chunk_size: u32) -> Result<Vec<Hash>> {
    if chunk_size == 0 {
        return Ok(Vec::new());
    }
    chunk_groups(buffer, chunk_size)
        .map(|(tag, _)| {
            tag.try_into()
                .map_err(|_| VaultError::integrity("truncated chunk tag"))
        })
        .collect()
}

/// Removes the tags from post-header content, leaving the ciphertext.
pub fn strip_signatures(buffer: &[u8], chunk_size: u32) -> Vec<u8> {
    if chunk_size == 0 {
        return buffer.to_vec();
    }
    let mut out = Vec::with_capacity(plaintext_length(buffer.len() as u64, chunk_size) as usize);
    for (_, chunk) in chunk_groups(buffer, chunk_size) {
        out.extend_from_slice(chunk);
    }
    out
}
