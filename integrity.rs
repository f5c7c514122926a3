//! Chunked HMAC-SHA256 integrity.
//!
//! Content is split into fixed-size chunks and each chunk carries its own tag,
//! computed over the ciphertext. The header bytes are folded into the tag of
//! the first chunk only. Verification is chunk-local: a damaged byte fails
//! its own chunk and no other.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::cipher::BLOCK_SIZE;
use crate::error::{Result, VaultError};
use crate::key_manager::SecretKey;

/// Length of a chunk tag
pub const HASH_RESULT_LENGTH: usize = 32;

/// Length of the hash key
pub const HASH_KEY_LENGTH: usize = 32;

/// Chunk size used when integrity is requested without an explicit size
pub const DEFAULT_CHUNK_SIZE: u32 = 256 * 1024;

/// Largest chunk size accepted
pub const MAX_CHUNK_SIZE: u32 = 8 * 1024 * 1024;

pub type Hash = [u8; HASH_RESULT_LENGTH];

/// Keyed hash primitive used for chunk tags.
pub trait HashProvider: Send + Sync {
    /// Computes the tag of `data`, prefixed with `header` when present.
    fn calc(&self, key: &[u8], header: Option<&[u8]>, data: &[u8]) -> Result<Hash>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HmacSha256Provider;

impl HashProvider for HmacSha256Provider {
    fn calc(&self, key: &[u8], header: Option<&[u8]>, data: &[u8]) -> Result<Hash> {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
            .map_err(|_| VaultError::security("invalid hash key"))?;
        if let Some(header) = header {
            mac.update(header);
        }
        mac.update(data);
        let mut out = [0u8; HASH_RESULT_LENGTH];
        out.copy_from_slice(&mac.finalize().into_bytes());
        Ok(out)
    }
}

/// Computes one tag with an explicit provider and key.
pub fn calculate_hash(
    provider: &dyn HashProvider,
    data: &[u8],
    key: &[u8],
    header: Option<&[u8]>,
) -> Result<Hash> {
    provider.calc(key, header, data)
}

/// Checks that `chunk_size` is 0 or a positive multiple of the block size
/// within [`MAX_CHUNK_SIZE`].
pub fn validate_chunk_size(chunk_size: u32) -> Result<()> {
    if chunk_size != 0 && (chunk_size % BLOCK_SIZE as u32 != 0 || chunk_size > MAX_CHUNK_SIZE) {
        return Err(VaultError::security(format!(
            "invalid chunk size {chunk_size}: must be 0 or a multiple of {BLOCK_SIZE} up to {MAX_CHUNK_SIZE}"
        )));
    }
    Ok(())
}

/// Per-stream integrity settings.
///
/// `chunk_size > 0` means the content carries tags. Whether they are generated
/// or verified depends on `apply`; a reader that does not apply integrity
/// still has to skip the tags.
#[derive(Clone)]
pub struct Integrity {
    apply: bool,
    key: Option<SecretKey>,
    chunk_size: u32,
    provider: Arc<dyn HashProvider>,
}

impl Integrity {
    pub fn new(apply: bool, key: Option<SecretKey>, chunk_size: u32) -> Result<Self> {
        Self::with_provider(apply, key, chunk_size, Arc::new(HmacSha256Provider))
    }

    pub fn with_provider(
        apply: bool,
        key: Option<SecretKey>,
        chunk_size: u32,
        provider: Arc<dyn HashProvider>,
    ) -> Result<Self> {
        validate_chunk_size(chunk_size)?;
        if apply && key.is_none() {
            return Err(VaultError::security(
                "integrity requested without a hash key",
            ));
        }
        let chunk_size = if apply && chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        Ok(Self {
            apply,
            key,
            chunk_size,
            provider,
        })
    }

    /// Settings for existing content whose chunk size is fixed by its header.
    pub fn for_content(verify: bool, key: Option<SecretKey>, chunk_size: u32) -> Result<Self> {
        if verify && chunk_size == 0 {
            return Err(VaultError::security(
                "verification requested but the content carries no integrity tags",
            ));
        }
        Self::new(verify, if verify { key } else { None }, chunk_size)
    }

    /// Settings for new content: no tags at all unless integrity is applied.
    pub fn for_writing(apply: bool, key: Option<SecretKey>, chunk_size: u32) -> Result<Self> {
        if apply {
            Self::new(true, key, chunk_size)
        } else {
            Ok(Self::disabled())
        }
    }

    /// No tags on the wire and nothing to verify.
    pub fn disabled() -> Self {
        Self {
            apply: false,
            key: None,
            chunk_size: 0,
            provider: Arc::new(HmacSha256Provider),
        }
    }

    pub fn apply(&self) -> bool {
        self.apply
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Bytes of tag preceding every chunk on the wire.
    pub fn hash_length(&self) -> usize {
        if self.chunk_size > 0 {
            HASH_RESULT_LENGTH
        } else {
            0
        }
    }

    pub fn calculate_hash(&self, chunk: &[u8], header: Option<&[u8]>) -> Result<Hash> {
        let key = self
            .key
            .as_ref()
            .ok_or_else(|| VaultError::security("no hash key available"))?;
        calculate_hash(self.provider.as_ref(), chunk, key.as_bytes(), header)
    }

    /// Tags every chunk of `buffer`. `header` is mixed into the first one.
    pub fn generate_hashes(&self, buffer: &[u8], header: Option<&[u8]>) -> Result<Vec<Hash>> {
        if !self.apply || self.chunk_size == 0 {
            return Ok(Vec::new());
        }
        buffer
            .chunks(self.chunk_size as usize)
            .enumerate()
            .map(|(i, chunk)| self.calculate_hash(chunk, if i == 0 { header } else { None }))
            .collect()
    }

    /// Verifies one chunk against its stored tag in constant time.
    pub fn verify_chunk(&self, expected: &[u8], chunk: &[u8], header: Option<&[u8]>) -> Result<()> {
        let actual = self.calculate_hash(chunk, header)?;
        if bool::from(actual[..].ct_eq(expected)) {
            Ok(())
        } else {
            Err(VaultError::integrity("chunk tag does not match its content"))
        }
    }

    /// Verifies `buffer` chunk by chunk, failing on the first mismatch.
    pub fn verify_hashes(&self, hashes: &[Hash], buffer: &[u8], header: Option<&[u8]>) -> Result<()> {
        if !self.apply || self.chunk_size == 0 {
            return Ok(());
        }
        let chunks = buffer.chunks(self.chunk_size as usize);
        if chunks.len() != hashes.len() {
            return Err(VaultError::integrity(format!(
                "expected {} tags, found {}",
                chunks.len(),
                hashes.len()
            )));
        }
        for (i, (chunk, hash)) in chunks.zip(hashes).enumerate() {
            self.verify_chunk(hash, chunk, if i == 0 { header } else { None })
                .map_err(|_| VaultError::integrity(format!("chunk {i} failed verification")))?;
        }
        Ok(())
    }
}

impl fmt::Debug for Integrity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Integrity")
            .field("apply", &self.apply)
            .field("chunk_size", &self.chunk_size)
            .field("has_key", &self.key.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn integrity(chunk_size: u32) -> Integrity {
        Integrity::new(true, Some(SecretKey::from_bytes([5u8; 32])), chunk_size).unwrap()
    }

    #[test]
    fn chunk_size_rules() {
        assert!(validate_chunk_size(0).is_ok());
        assert!(validate_chunk_size(16).is_ok());
        assert!(validate_chunk_size(MAX_CHUNK_SIZE).is_ok());
        assert!(validate_chunk_size(20).is_err());
        assert!(validate_chunk_size(MAX_CHUNK_SIZE + 16).is_err());
    }

    #[test]
    fn zero_chunk_size_uses_default() {
        assert_eq!(integrity(0).chunk_size(), DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn requires_key_when_applied() {
        let err = Integrity::new(true, None, 64).unwrap_err();
        assert!(matches!(err, VaultError::Security(_)));
        assert!(Integrity::new(false, None, 64).is_ok());
    }

    #[test]
    fn tamper_only_fails_its_chunk() {
        let integrity = integrity(32);
        let mut data = vec![7u8; 100];
        let header = b"header-bytes";
        let hashes = integrity.generate_hashes(&data, Some(header)).unwrap();
        assert_eq!(hashes.len(), 4);
        integrity.verify_hashes(&hashes, &data, Some(header)).unwrap();

        data[40] ^= 1;
        let err = integrity.verify_hashes(&hashes, &data, Some(header)).unwrap_err();
        assert!(err.to_string().contains("chunk 1"), "{err}");
        integrity.verify_chunk(&hashes[0], &data[..32], Some(header)).unwrap();
        integrity.verify_chunk(&hashes[2], &data[64..96], None).unwrap();
    }

    #[test]
    fn header_is_bound_to_first_chunk() {
        let integrity = integrity(32);
        let data = vec![1u8; 64];
        let hashes = integrity.generate_hashes(&data, Some(b"one")).unwrap();
        assert!(integrity.verify_hashes(&hashes, &data, Some(b"two")).is_err());
        integrity.verify_chunk(&hashes[1], &data[32..], None).unwrap();
    }
}
