//! Drive sessions.
//!
//! A [`Drive`] is the context every virtual file operation runs against: it
//! owns the keys, the drive id, the sequencer handle and the real root.
//!
//! ## Layout
//!
//! ```text
//! <root>/vault.cfg   drive config (salt, iterations, wrapped keys)
//! <root>/fs/         encrypted file tree
//! <root>/export/     default export target
//! ```
//!
//! ## Config Format
//!
//! ```text
//! [magic:3][version:1][salt:24][iterations:4 BE][iv:16][wrapped:80][hmac:32]
//! wrapped = AES-CTR(master_key, iv, drive_key:32 | hash_key:32 | drive_id:16)
//! hmac    = HMAC-SHA256(hash_key, wrapped)
//! ```
//!
//! A wrong password unwraps a different hash key, so the HMAC check fails
//! before any key is handed out.

use std::fmt;
use std::io::{Cursor, Read, Write};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::cipher::{ProviderType, BLOCK_SIZE, KEY_LENGTH};
use crate::error::{Result, VaultError};
use crate::header::{EncryptionMode, MAGIC, VERSION};
use crate::integrity::{calculate_hash, Hash, HmacSha256Provider, DEFAULT_CHUNK_SIZE, HASH_RESULT_LENGTH};
use crate::key_manager::{
    derive_key, random_bytes, KeyManager, SecretKey, AUTH_ID_LENGTH, DEFAULT_ITERATIONS,
    DRIVE_ID_LENGTH, SALT_LENGTH,
};
use crate::nonce::Nonce;
use crate::real_file::RealFile;
use crate::sequencer::NonceSequencer;
use crate::streaming::ContentStream;
use crate::virtual_file::VirtualFile;

pub const CONFIG_FILENAME: &str = "vault.cfg";
pub const VIRTUAL_DIR: &str = "fs";
pub const EXPORT_DIR: &str = "export";

const WRAPPED_LENGTH: usize = 2 * KEY_LENGTH + DRIVE_ID_LENGTH;
const CONFIG_LENGTH: usize =
    MAGIC.len() + 1 + SALT_LENGTH + 4 + BLOCK_SIZE + WRAPPED_LENGTH + HASH_RESULT_LENGTH;

/// Settings applied to a drive session.
#[derive(Debug, Clone)]
pub struct DriveOptions {
    /// PBKDF2 iterations used when (re)writing the config
    pub iterations: u32,
    pub provider: ProviderType,
    /// Apply and verify chunk tags on new files
    pub integrity: bool,
    pub chunk_size: u32,
}

impl Default for DriveOptions {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
            provider: ProviderType::default(),
            integrity: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

struct DriveConfig {
    salt: [u8; SALT_LENGTH],
    iterations: u32,
    iv: [u8; BLOCK_SIZE],
    wrapped: [u8; WRAPPED_LENGTH],
    hash: Hash,
}

impl DriveConfig {
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CONFIG_LENGTH);
        out.extend_from_slice(&MAGIC);
        out.push(VERSION);
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&self.iterations.to_be_bytes());
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.wrapped);
        out.extend_from_slice(&self.hash);
        out
    }

    fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != CONFIG_LENGTH {
            return Err(VaultError::format(format!(
                "drive config must be {CONFIG_LENGTH} bytes, found {}",
                bytes.len()
            )));
        }
        if bytes[..3] != MAGIC || bytes[3] != VERSION {
            return Err(VaultError::format("not a drive config file"));
        }
        let salt_end = 4 + SALT_LENGTH;
        let iv_start = salt_end + 4;
        let wrapped_start = iv_start + BLOCK_SIZE;
        let hash_start = wrapped_start + WRAPPED_LENGTH;

        let mut salt = [0u8; SALT_LENGTH];
        salt.copy_from_slice(&bytes[4..salt_end]);
        let iterations = u32::from_be_bytes([
            bytes[salt_end],
            bytes[salt_end + 1],
            bytes[salt_end + 2],
            bytes[salt_end + 3],
        ]);
        let mut iv = [0u8; BLOCK_SIZE];
        iv.copy_from_slice(&bytes[iv_start..wrapped_start]);
        let mut wrapped = [0u8; WRAPPED_LENGTH];
        wrapped.copy_from_slice(&bytes[wrapped_start..hash_start]);
        let mut hash = [0u8; HASH_RESULT_LENGTH];
        hash.copy_from_slice(&bytes[hash_start..]);
        Ok(Self {
            salt,
            iterations,
            iv,
            wrapped,
            hash,
        })
    }
}

/// CTR transform of a small buffer with no header or tags.
fn transform_raw(
    mode: EncryptionMode,
    key: &SecretKey,
    iv: &[u8],
    data: &[u8],
    provider: ProviderType,
) -> Result<Zeroizing<Vec<u8>>> {
    let mut out = Zeroizing::new(Vec::with_capacity(data.len()));
    match mode {
        EncryptionMode::Encrypt => {
            let mut stream =
                ContentStream::attach_raw(Cursor::new(Vec::new()), mode, key, iv, provider)?;
            stream.write_all(data)?;
            out.extend_from_slice(stream.finish()?.get_ref());
        }
        EncryptionMode::Decrypt => {
            let mut stream = ContentStream::attach_raw(Cursor::new(data), mode, key, iv, provider)?;
            stream.read_to_end(&mut out)?;
        }
    }
    Ok(out)
}

/// An open drive.
pub struct Drive {
    real_root: Box<dyn RealFile>,
    virtual_root: Box<dyn RealFile>,
    keys: KeyManager,
    drive_id: [u8; DRIVE_ID_LENGTH],
    sequencer: Arc<dyn NonceSequencer>,
    options: DriveOptions,
}

impl Drive {
    /// True if `root` holds a drive config.
    pub fn exists(root: &dyn RealFile) -> bool {
        root.child(CONFIG_FILENAME).exists()
    }

    /// Creates a new drive in the existing directory `root`.
    ///
    /// Generates fresh keys and ids and gives this device the full nonce
    /// range.
    pub fn create(
        root: Box<dyn RealFile>,
        password: &str,
        sequencer: Arc<dyn NonceSequencer>,
        options: DriveOptions,
    ) -> Result<Self> {
        if Self::exists(root.as_ref()) {
            return Err(VaultError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("a drive already exists at {}", root.path()),
            )));
        }
        if !root.is_directory() {
            return Err(VaultError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("drive directory {} does not exist", root.path()),
            )));
        }

        let drive_id: [u8; DRIVE_ID_LENGTH] = random_bytes();
        let auth_id: [u8; AUTH_ID_LENGTH] = random_bytes();
        let salt: [u8; SALT_LENGTH] = random_bytes();
        let master_key = derive_key(password, &salt, options.iterations)?;
        let keys = KeyManager::new(
            master_key,
            SecretKey::generate(),
            SecretKey::generate(),
            options.iterations,
        );
        write_config(root.as_ref(), &keys, &drive_id, &salt, options.provider)?;

        let drive_hex = hex::encode(drive_id);
        let auth_hex = hex::encode(auth_id);
        sequencer.create_sequence(&drive_hex, &auth_hex)?;
        sequencer.initialize_sequence(&drive_hex, &auth_hex, Nonce::START, Nonce::MAX)?;

        let virtual_root = root.create_directory(VIRTUAL_DIR)?;
        info!(drive_id = %drive_hex, path = %root.path(), "drive created");
        Ok(Self {
            real_root: root,
            virtual_root,
            keys,
            drive_id,
            sequencer,
            options,
        })
    }

    /// Opens an existing drive; fails with [`VaultError::Auth`] on a wrong
    /// password.
    pub fn open(
        root: Box<dyn RealFile>,
        password: &str,
        sequencer: Arc<dyn NonceSequencer>,
        options: DriveOptions,
    ) -> Result<Self> {
        let mut bytes = Vec::new();
        root.child(CONFIG_FILENAME)
            .open_read()?
            .read_to_end(&mut bytes)?;
        let config = DriveConfig::parse(&bytes)?;

        let master_key = derive_key(password, &config.salt, config.iterations)?;
        let plain = transform_raw(
            EncryptionMode::Decrypt,
            &master_key,
            &config.iv,
            &config.wrapped,
            options.provider,
        )?;
        let hash_key = SecretKey::from_slice(&plain[KEY_LENGTH..2 * KEY_LENGTH])?;
        let expected = calculate_hash(&HmacSha256Provider, &config.wrapped, hash_key.as_bytes(), None)?;
        if !bool::from(expected[..].ct_eq(&config.hash[..])) {
            return Err(VaultError::auth("wrong password"));
        }

        let drive_key = SecretKey::from_slice(&plain[..KEY_LENGTH])?;
        let mut drive_id = [0u8; DRIVE_ID_LENGTH];
        drive_id.copy_from_slice(&plain[2 * KEY_LENGTH..]);
        let keys = KeyManager::new(master_key, drive_key, hash_key, config.iterations);

        let virtual_root = root.child(VIRTUAL_DIR);
        let virtual_root = if virtual_root.is_directory() {
            virtual_root
        } else {
            root.create_directory(VIRTUAL_DIR)?
        };
        info!(drive_id = %hex::encode(drive_id), path = %root.path(), "drive opened");
        Ok(Self {
            real_root: root,
            virtual_root,
            keys,
            drive_id,
            sequencer,
            options,
        })
    }

    /// Re-wraps the drive keys under a new password and salt.
    pub fn change_password(&mut self, new_password: &str) -> Result<()> {
        let salt: [u8; SALT_LENGTH] = random_bytes();
        let iterations = self.options.iterations;
        let master_key = derive_key(new_password, &salt, iterations)?;
        self.keys.set_master_key(master_key, iterations);
        write_config(
            self.real_root.as_ref(),
            &self.keys,
            &self.drive_id,
            &salt,
            self.options.provider,
        )?;
        info!(drive_id = %self.drive_id(), "drive password changed");
        Ok(())
    }

    /// Drive id as lowercase hex.
    pub fn drive_id(&self) -> String {
        hex::encode(self.drive_id)
    }

    pub fn drive_id_bytes(&self) -> &[u8; DRIVE_ID_LENGTH] {
        &self.drive_id
    }

    /// This device's authorization id, registering a new one if the device
    /// has no live sequence for this drive.
    pub fn auth_id(&self) -> Result<String> {
        let drive_id = self.drive_id();
        if let Some(sequence) = self.sequencer.get_sequence(&drive_id)? {
            return Ok(sequence.auth_id);
        }
        let auth_id = hex::encode(random_bytes::<AUTH_ID_LENGTH>());
        self.sequencer.create_sequence(&drive_id, &auth_id)?;
        debug!(drive_id = %drive_id, "registered new device sequence");
        Ok(auth_id)
    }

    /// Takes the next nonce from this device's range.
    pub fn next_nonce(&self) -> Result<Nonce> {
        self.sequencer.next_nonce(&self.drive_id())
    }

    /// Stops this device from encrypting anything further on this drive.
    pub fn revoke_authorization(&self) -> Result<()> {
        self.sequencer.revoke_sequence(&self.drive_id())
    }

    pub fn sequencer(&self) -> &Arc<dyn NonceSequencer> {
        &self.sequencer
    }

    pub fn keys(&self) -> &KeyManager {
        &self.keys
    }

    pub fn options(&self) -> &DriveOptions {
        &self.options
    }

    pub fn real_root(&self) -> &dyn RealFile {
        self.real_root.as_ref()
    }

    pub(crate) fn virtual_root(&self) -> &dyn RealFile {
        self.virtual_root.as_ref()
    }

    /// Root directory of the virtual tree.
    pub fn root(&self) -> VirtualFile<'_> {
        VirtualFile::new(self, self.virtual_root.clone())
    }

    /// Wraps a real file of this drive's tree as a virtual file.
    pub fn file(&self, real: Box<dyn RealFile>) -> Result<VirtualFile<'_>> {
        if !self.virtual_root.contains(real.as_ref()) {
            return Err(VaultError::auth(format!(
                "{} does not belong to this drive",
                real.path()
            )));
        }
        Ok(VirtualFile::new(self, real))
    }

    /// Walks a `/`-separated virtual path from the root.
    pub fn resolve(&self, path: &str) -> Result<Option<VirtualFile<'_>>> {
        let mut current = self.root();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            match current.child(segment)? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Default export directory, created on first use.
    pub fn export_dir(&self) -> Result<Box<dyn RealFile>> {
        let dir = self.real_root.child(EXPORT_DIR);
        if dir.is_directory() {
            Ok(dir)
        } else {
            self.real_root.create_directory(EXPORT_DIR)
        }
    }

    /// Ends the session; keys are wiped as they drop.
    pub fn close(self) {
        info!(drive_id = %self.drive_id(), "drive closed");
    }
}

fn write_config(
    root: &dyn RealFile,
    keys: &KeyManager,
    drive_id: &[u8; DRIVE_ID_LENGTH],
    salt: &[u8; SALT_LENGTH],
    provider: ProviderType,
) -> Result<()> {
    let iv: [u8; BLOCK_SIZE] = random_bytes();
    let mut plain = Zeroizing::new(Vec::with_capacity(WRAPPED_LENGTH));
    plain.extend_from_slice(keys.drive_key().as_bytes());
    plain.extend_from_slice(keys.hash_key().as_bytes());
    plain.extend_from_slice(drive_id);

    let wrapped = transform_raw(EncryptionMode::Encrypt, keys.master_key(), &iv, &plain, provider)?;
    let hash = calculate_hash(&HmacSha256Provider, &wrapped, keys.hash_key().as_bytes(), None)?;
    let config = DriveConfig {
        salt: *salt,
        iterations: keys.iterations(),
        iv,
        wrapped: wrapped
            .as_slice()
            .try_into()
            .map_err(|_| VaultError::format("wrapped key length"))?,
        hash,
    };

    let file = root.child(CONFIG_FILENAME);
    let mut stream = file.open_write()?;
    stream.set_length(0)?;
    stream.write_all(&config.to_bytes())?;
    stream.flush()?;
    Ok(())
}

impl fmt::Debug for Drive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Drive")
            .field("drive_id", &self.drive_id())
            .field("root", &self.real_root.path())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::real_file::LocalFile;
    use crate::sequencer::MemorySequencer;
    use tempfile::TempDir;

    fn options() -> DriveOptions {
        DriveOptions {
            iterations: 16,
            chunk_size: 64,
            ..DriveOptions::default()
        }
    }

    #[test]
    fn create_then_open() {
        let tmp = TempDir::new().unwrap();
        let sequencer: Arc<dyn NonceSequencer> = Arc::new(MemorySequencer::new());
        let root = Box::new(LocalFile::new(tmp.path()));
        let drive = Drive::create(root.clone(), "secret", sequencer.clone(), options()).unwrap();
        let id = drive.drive_id();
        assert_eq!(drive.next_nonce().unwrap(), Nonce::START);
        drive.close();

        let config = std::fs::read(tmp.path().join(CONFIG_FILENAME)).unwrap();
        assert_eq!(config.len(), CONFIG_LENGTH);

        let drive = Drive::open(root, "secret", sequencer, options()).unwrap();
        assert_eq!(drive.drive_id(), id);
        assert_eq!(drive.next_nonce().unwrap().to_u64(), 1);
    }

    #[test]
    fn wrong_password_is_auth_error() {
        let tmp = TempDir::new().unwrap();
        let sequencer: Arc<dyn NonceSequencer> = Arc::new(MemorySequencer::new());
        let root = Box::new(LocalFile::new(tmp.path()));
        Drive::create(root.clone(), "secret", sequencer.clone(), options()).unwrap();
        let err = Drive::open(root, "Secret", sequencer, options()).unwrap_err();
        assert!(matches!(err, VaultError::Auth(_)), "{err:?}");
    }

    #[test]
    fn cannot_create_twice() {
        let tmp = TempDir::new().unwrap();
        let sequencer: Arc<dyn NonceSequencer> = Arc::new(MemorySequencer::new());
        let root = Box::new(LocalFile::new(tmp.path()));
        Drive::create(root.clone(), "a", sequencer.clone(), options()).unwrap();
        assert!(Drive::create(root, "b", sequencer, options()).is_err());
    }

    #[test]
    fn change_password_keeps_keys() {
        let tmp = TempDir::new().unwrap();
        let sequencer: Arc<dyn NonceSequencer> = Arc::new(MemorySequencer::new());
        let root = Box::new(LocalFile::new(tmp.path()));
        let mut drive = Drive::create(root.clone(), "old", sequencer.clone(), options()).unwrap();
        let drive_key = drive.keys().drive_key().clone();
        drive.change_password("new").unwrap();
        drive.close();

        assert!(Drive::open(root.clone(), "old", sequencer.clone(), options()).is_err());
        let drive = Drive::open(root, "new", sequencer, options()).unwrap();
        assert_eq!(drive.keys().drive_key(), &drive_key);
    }

    #[test]
    fn revoked_device_gets_new_auth_id() {
        let tmp = TempDir::new().unwrap();
        let sequencer: Arc<dyn NonceSequencer> = Arc::new(MemorySequencer::new());
        let drive = Drive::create(
            Box::new(LocalFile::new(tmp.path())),
            "pw",
            sequencer,
            options(),
        )
        .unwrap();
        let before = drive.auth_id().unwrap();
        drive.revoke_authorization().unwrap();
        assert!(drive.next_nonce().is_err());
        let after = drive.auth_id().unwrap();
        assert_ne!(before, after);
        // registered but without a range yet
        assert!(drive.next_nonce().is_err());
    }

    #[test]
    fn foreign_real_files_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let sequencer: Arc<dyn NonceSequencer> = Arc::new(MemorySequencer::new());
        let drive = Drive::create(
            Box::new(LocalFile::new(tmp.path())),
            "pw",
            sequencer,
            options(),
        )
        .unwrap();
        let err = drive
            .file(Box::new(LocalFile::new(other.path().join("x"))))
            .unwrap_err();
        assert!(matches!(err, VaultError::Auth(_)));
    }
}
