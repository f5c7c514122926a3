//! AES-256 in counter mode.
//!
//! The keystream block for logical byte offset `p` is `AES(key, nonce || p / 16)`,
//! so any aligned position can be transformed without touching the bytes
//! before it. Encryption and decryption are the same operation.
//!
//! Two interchangeable backends implement [`CtrTransformer`]:
//!
//! - [`ProviderType::Aes`]: the raw block cipher with counters computed here
//! - [`ProviderType::AesCtr`]: the `ctr` crate keystream generator
//!
//! Both expand the key schedule once, when the transformer is created.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, InnerIvInit, KeyInit, StreamCipher};
use aes::Aes256;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, VaultError};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;

/// AES-256 key length in bytes
pub const KEY_LENGTH: usize = 32;

/// A full 128-bit CTR counter block
pub type Counter = [u8; BLOCK_SIZE];

/// Selects the AES backend used by content streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProviderType {
    #[default]
    Aes,
    AesCtr,
}

/// Applies the CTR keystream starting at a given counter block.
pub trait CtrTransformer: Send + Sync {
    /// XORs the keystream starting at `counter` over `src` into `dst` and
    /// returns the number of bytes written.
    fn transform(&self, counter: &Counter, src: &[u8], dst: &mut [u8]) -> Result<usize>;

    fn provider(&self) -> ProviderType;
}

/// Builds the counter for `block_index` blocks past `nonce`.
///
/// The nonce occupies the high bytes of the counter; the block index is added
/// as a 128-bit big-endian integer, so a 16-byte IV carries into its upper half.
pub fn counter_for(nonce: &[u8], block_index: u64) -> Result<Counter> {
    if nonce.is_empty() || nonce.len() > BLOCK_SIZE {
        return Err(VaultError::security(format!(
            "nonce must be 1..={} bytes, got {}",
            BLOCK_SIZE,
            nonce.len()
        )));
    }
    let mut counter = [0u8; BLOCK_SIZE];
    counter[..nonce.len()].copy_from_slice(nonce);
    let value = u128::from_be_bytes(counter).wrapping_add(u128::from(block_index));
    Ok(value.to_be_bytes())
}

/// Creates a transformer for `key` using the requested backend.
pub fn create_transformer(
    provider: ProviderType,
    key: &[u8; KEY_LENGTH],
) -> Box<dyn CtrTransformer> {
    let cipher = Aes256::new(GenericArray::from_slice(key));
    match provider {
        ProviderType::Aes => Box::new(AesTransformer { cipher }),
        ProviderType::AesCtr => Box::new(AesCtrTransformer { cipher }),
    }
}

fn check_lengths(src: &[u8], dst: &[u8]) -> Result<()> {
    if dst.len() < src.len() {
        return Err(VaultError::security(format!(
            "destination holds {} bytes, {} needed",
            dst.len(),
            src.len()
        )));
    }
    Ok(())
}

struct AesTransformer {
    cipher: Aes256,
}

impl CtrTransformer for AesTransformer {
    fn transform(&self, counter: &Counter, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        check_lengths(src, dst)?;
        let base = u128::from_be_bytes(*counter);
        let mut blocks: Vec<aes::Block> = (0..src.len().div_ceil(BLOCK_SIZE))
            .map(|i| {
                let value = base.wrapping_add(i as u128);
                aes::Block::clone_from_slice(&value.to_be_bytes())
            })
            .collect();
        self.cipher.encrypt_blocks(&mut blocks);

        for (i, (s, d)) in src.iter().zip(dst.iter_mut()).enumerate() {
            *d = s ^ blocks[i / BLOCK_SIZE][i % BLOCK_SIZE];
        }
        Ok(src.len())
    }

    fn provider(&self) -> ProviderType {
        ProviderType::Aes
    }
}

struct AesCtrTransformer {
    cipher: Aes256,
}

impl CtrTransformer for AesCtrTransformer {
    fn transform(&self, counter: &Counter, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        check_lengths(src, dst)?;
        let mut stream =
            Aes256Ctr::from_core(ctr::CtrCore::inner_iv_init(
                self.cipher.clone(),
                GenericArray::from_slice(counter),
            ));
        let out = &mut dst[..src.len()];
        out.copy_from_slice(src);
        stream.apply_keystream(out);
        Ok(src.len())
    }

    fn provider(&self) -> ProviderType {
        ProviderType::AesCtr
    }
}

impl fmt::Debug for dyn CtrTransformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CtrTransformer")
            .field("provider", &self.provider())
            .finish_non_exhaustive()
    }
}
