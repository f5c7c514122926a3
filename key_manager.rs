//! Key material for an open drive.
//!
//! This module provides [`SecretKey`] and [`KeyManager`], which hold the
//! password-derived master key and the random drive and hash keys for the
//! lifetime of a drive session.
//!
//! ## Security Features
//!
//! - Keys are zeroized on drop (via `ZeroizeOnDrop`)
//! - Key comparison is constant time
//! - Random material comes from `OsRng`
//! - `Debug` output never includes key bytes

use pbkdf2::pbkdf2_hmac;
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use std::fmt;
use subtle::ConstantTimeEq;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::cipher::KEY_LENGTH;
use crate::error::{Result, VaultError};

/// Length of the PBKDF2 salt stored in the drive config
pub const SALT_LENGTH: usize = 24;

/// Length of a drive identifier
pub const DRIVE_ID_LENGTH: usize = 16;

/// Length of a device authorization identifier
pub const AUTH_ID_LENGTH: usize = 16;

/// Default PBKDF2 iteration count for new drives
pub const DEFAULT_ITERATIONS: u32 = 65536;

/// A 256-bit key that is wiped from memory when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey([u8; KEY_LENGTH]);

impl SecretKey {
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; KEY_LENGTH] = bytes.try_into().map_err(|_| {
            VaultError::security(format!(
                "key must be {} bytes, got {}",
                KEY_LENGTH,
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    pub fn generate() -> Self {
        Self(random_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }
}

impl PartialEq for SecretKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for SecretKey {}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey([REDACTED])")
    }
}

/// Holds the keys of an open drive.
///
/// The master key is derived from the password and only wraps the other two:
/// the drive key encrypts content and names, the hash key signs chunks.
pub struct KeyManager {
    master_key: SecretKey,
    drive_key: SecretKey,
    hash_key: SecretKey,
    iterations: u32,
}

impl KeyManager {
    pub fn new(
        master_key: SecretKey,
        drive_key: SecretKey,
        hash_key: SecretKey,
        iterations: u32,
    ) -> Self {
        Self {
            master_key,
            drive_key,
            hash_key,
            iterations,
        }
    }

    pub fn master_key(&self) -> &SecretKey {
        &self.master_key
    }

    pub fn drive_key(&self) -> &SecretKey {
        &self.drive_key
    }

    pub fn hash_key(&self) -> &SecretKey {
        &self.hash_key
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Replaces the master key, e.g. after a password change.
    pub fn set_master_key(&mut self, master_key: SecretKey, iterations: u32) {
        self.master_key = master_key;
        self.iterations = iterations;
    }
}

impl fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyManager")
            .field("iterations", &self.iterations)
            .finish_non_exhaustive()
    }
}

/// Derives a master key from a password with PBKDF2-HMAC-SHA256.
pub fn derive_key(password: &str, salt: &[u8], iterations: u32) -> Result<SecretKey> {
    if iterations == 0 {
        return Err(VaultError::security("iteration count must be positive"));
    }
    if salt.len() < SALT_LENGTH {
        return Err(VaultError::security(format!(
            "salt must be at least {} bytes",
            SALT_LENGTH
        )));
    }
    debug!(iterations, "deriving master key");
    let mut key = [0u8; KEY_LENGTH];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut key);
    let derived = SecretKey::from_bytes(key);
    key.zeroize();
    Ok(derived)
}

/// Fills an array from the operating system's CSPRNG.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    OsRng.fill_bytes(&mut buf);
    buf
}
